//! Actor scheduling for RivetDB.
//!
//! A [`Mailbox`] is a single-consumer task queue: tasks enqueued on the same
//! mailbox run serialized, in FIFO order, on the shared tokio runtime. An
//! actor is any object that owns a mailbox and exposes public methods which
//! enqueue calls to its private implementation, so the implementation is
//! effectively single-threaded without ever blocking a worker.
//!
//! Delayed tasks may be overtaken by later non-delayed tasks; callers that
//! need strict ordering must chain explicitly.

pub mod notifier;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct MailboxShared {
    name: String,
    // Tasks enqueued but not yet finished running.
    event_count: AtomicUsize,
}

/// A serialized task queue backed by a dedicated consumer task.
pub struct Mailbox {
    tx: mpsc::UnboundedSender<Task>,
    shared: Arc<MailboxShared>,
}

impl Mailbox {
    /// Creates a mailbox and spawns its consumer on the current runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(MailboxShared {
            name: name.into(),
            event_count: AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let consumer_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
                consumer_shared.event_count.fetch_sub(1, Ordering::AcqRel);
            }
            debug!(mailbox = %consumer_shared.name, "mailbox drained and closed");
        });
        Mailbox { tx, shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of tasks enqueued and not yet completed.
    pub fn event_count(&self) -> usize {
        self.shared.event_count.load(Ordering::Acquire)
    }

    /// Enqueues a task. Returns false if the mailbox has been closed.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.shared.event_count.fetch_add(1, Ordering::AcqRel);
        let ok = self.tx.send(Box::new(task)).is_ok();
        if !ok {
            self.shared.event_count.fetch_sub(1, Ordering::AcqRel);
        }
        ok
    }

    /// Enqueues a task after a delay. The task may be overtaken by tasks
    /// enqueued later without a delay. The returned handle cancels it.
    pub fn enqueue_after(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let token = CancellationToken::new();
        let tx = self.tx.clone();
        let shared = self.shared.clone();
        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    shared.event_count.fetch_add(1, Ordering::AcqRel);
                    if tx.send(Box::new(task)).is_err() {
                        shared.event_count.fetch_sub(1, Ordering::AcqRel);
                    }
                }
                _ = timer_token.cancelled() => {}
            }
        });
        TimerHandle { token }
    }

    /// Resolves once every task enqueued before this call has finished.
    pub async fn drain(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.enqueue(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

/// Handle to a delayed task; dropping it does *not* cancel the task.
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// An object whose work runs serialized on its own mailbox.
pub trait Actor: Send + Sync + 'static {
    fn mailbox(&self) -> &Mailbox;
}

/// Enqueue helpers available on any `Arc<impl Actor>`.
pub trait ActorExt: Actor {
    /// Schedules `f` to run with exclusive logical access to the actor.
    fn enqueue_self(self: &Arc<Self>, f: impl FnOnce(&Arc<Self>) + Send + 'static)
    where
        Self: Sized,
    {
        let this = self.clone();
        self.mailbox().enqueue(move || f(&this));
    }

    fn enqueue_self_after(
        self: &Arc<Self>,
        delay: Duration,
        f: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) -> TimerHandle
    where
        Self: Sized,
    {
        let this = self.clone();
        self.mailbox().enqueue_after(delay, move || f(&this))
    }
}

impl<T: Actor> ActorExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn tasks_run_in_fifo_order() {
        let mailbox = Mailbox::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = order.clone();
            mailbox.enqueue(move || order.lock().push(i));
        }
        mailbox.drain().await;
        let seen = order.lock().clone();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn event_count_tracks_pending_tasks() {
        let mailbox = Mailbox::new("count");
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        mailbox.enqueue(move || {
            gate_rx.recv().unwrap();
        });
        for _ in 0..4 {
            mailbox.enqueue(|| {});
        }
        assert!(mailbox.event_count() >= 4);
        gate_tx.send(()).unwrap();
        mailbox.drain().await;
        assert_eq!(mailbox.event_count(), 0);
    }

    #[tokio::test]
    async fn delayed_task_can_be_overtaken() {
        let mailbox = Mailbox::new("delay");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        mailbox.enqueue_after(Duration::from_millis(50), move || o1.lock().push("late"));
        let o2 = order.clone();
        mailbox.enqueue(move || o2.lock().push("early"));

        tokio::time::sleep(Duration::from_millis(120)).await;
        mailbox.drain().await;
        assert_eq!(order.lock().clone(), vec!["early", "late"]);
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let mailbox = Mailbox::new("cancel");
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        let handle = mailbox.enqueue_after(Duration::from_millis(30), move || *f.lock() = true);
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!*fired.lock());
    }

    struct Adder {
        mailbox: Mailbox,
        total: Mutex<i64>,
    }

    impl Actor for Adder {
        fn mailbox(&self) -> &Mailbox {
            &self.mailbox
        }
    }

    impl Adder {
        fn add(self: &Arc<Self>, n: i64) {
            self.enqueue_self(move |this| *this.total.lock() += n);
        }
    }

    #[tokio::test]
    async fn actor_methods_are_serialized() {
        let adder = Arc::new(Adder {
            mailbox: Mailbox::new("adder"),
            total: Mutex::new(0),
        });
        for i in 1..=100 {
            adder.add(i);
        }
        adder.mailbox.drain().await;
        assert_eq!(*adder.total.lock(), 5050);
    }
}
