//! Thread-safe observer list supporting mutation during iteration.
//!
//! Once `remove` returns, the removed observer will not be invoked again on
//! any thread: iteration holds the same (reentrant) lock, so a cross-thread
//! `remove` blocks until the current pass finishes, while a removal from
//! inside a callback adjusts the live iteration index.

use std::cell::RefCell;

use parking_lot::ReentrantMutex;

struct State<T> {
    observers: Vec<T>,
    // Current iteration index, or -1 when not iterating.
    cur_index: isize,
}

pub struct ObserverList<T> {
    state: ReentrantMutex<RefCell<State<T>>>,
}

impl<T> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObserverList<T> {
    pub fn new() -> Self {
        ObserverList {
            state: ReentrantMutex::new(RefCell::new(State {
                observers: Vec::new(),
                cur_index: -1,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().borrow().observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + PartialEq> ObserverList<T> {
    /// Adds an observer. With `unique`, refuses duplicates and returns false.
    pub fn add(&self, observer: T, unique: bool) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if unique && state.observers.contains(&observer) {
            return false;
        }
        state.observers.push(observer);
        true
    }

    /// Removes an observer. When this returns, the observer is guaranteed
    /// not to be invoked by any in-progress or future iteration.
    pub fn remove(&self, observer: &T) -> bool {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(pos) = state.observers.iter().position(|o| o == observer) {
            if (pos as isize) < state.cur_index {
                state.cur_index -= 1; // entries shift under the iterator
            }
            state.observers.remove(pos);
            true
        } else {
            false
        }
    }

    /// Invokes the callback once for each observer. Ordering is undefined.
    /// Observers added during the pass are not visited; observers removed
    /// during the pass are skipped if not yet visited. Only one thread can
    /// iterate at a time; reentrant iteration panics.
    pub fn iterate(&self, mut callback: impl FnMut(&T)) {
        let guard = self.state.lock();
        assert!(
            guard.borrow().cur_index == -1,
            "illegal reentrant iteration of ObserverList"
        );
        // Iterate backwards so observers added during a callback (appended
        // at the end) aren't visited in this pass.
        let last = guard.borrow().observers.len() as isize - 1;
        guard.borrow_mut().cur_index = last;
        loop {
            let index = guard.borrow().cur_index;
            if index < 0 {
                break;
            }
            // Clone the entry so the callback can re-enter add/remove
            // without holding a borrow of the vector.
            let observer = guard.borrow().observers.get(index as usize).cloned();
            if let Some(observer) = observer {
                callback(&observer);
            }
            guard.borrow_mut().cur_index -= 1;
        }
        guard.borrow_mut().cur_index = -1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_and_remove() {
        let list = ObserverList::new();
        assert!(list.add(1, true));
        assert!(list.add(2, true));
        assert!(!list.add(1, true)); // duplicate
        assert!(list.add(1, false)); // allowed when not unique
        assert_eq!(list.len(), 3);
        assert!(list.remove(&1));
        assert!(list.remove(&1));
        assert!(!list.remove(&1));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn iterate_visits_all() {
        let list = ObserverList::new();
        for i in 0..5 {
            list.add(i, true);
        }
        let mut seen = Vec::new();
        list.iterate(|&i| seen.push(i));
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn removed_during_iteration_not_visited() {
        let list = Arc::new(ObserverList::new());
        for i in 0..4 {
            list.add(i, true);
        }
        let mut seen = Vec::new();
        let inner = list.clone();
        list.iterate(|&i| {
            seen.push(i);
            if seen.len() == 1 {
                // Remove an entry that hasn't been visited yet (iteration is
                // backwards, so 0 comes last).
                assert!(inner.remove(&0));
            }
        });
        assert!(!seen.contains(&0), "removed observer was visited: {seen:?}");
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn added_during_iteration_not_visited_this_pass() {
        let list = Arc::new(ObserverList::new());
        list.add(1, true);
        list.add(2, true);
        let mut seen = Vec::new();
        let inner = list.clone();
        list.iterate(|&i| {
            seen.push(i);
            inner.add(100 + i, true);
        });
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains(&101));
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn self_removal_during_iteration() {
        let list = Arc::new(ObserverList::new());
        for i in 0..3 {
            list.add(i, true);
        }
        let count = AtomicUsize::new(0);
        let inner = list.clone();
        list.iterate(|&i| {
            count.fetch_add(1, Ordering::SeqCst);
            inner.remove(&i);
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn cross_thread_remove_blocks_until_pass_ends() {
        let list = Arc::new(ObserverList::<i32>::new());
        list.add(7, true);
        let calls = Arc::new(AtomicUsize::new(0));

        let list2 = list.clone();
        let calls2 = calls.clone();
        let handle = std::thread::spawn(move || {
            // Runs concurrently with iterations below; after remove returns,
            // no further invocation of 7 may happen.
            list2.remove(&7);
            let after = calls2.load(Ordering::SeqCst);
            for _ in 0..100 {
                assert_eq!(calls2.load(Ordering::SeqCst), after);
            }
        });

        for _ in 0..50 {
            list.iterate(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        handle.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "reentrant iteration")]
    fn reentrant_iteration_panics() {
        let list = Arc::new(ObserverList::new());
        list.add(1, true);
        let inner = list.clone();
        list.iterate(|_| {
            inner.iterate(|_| {});
        });
    }
}
