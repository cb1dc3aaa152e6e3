//! Echo cancellation for bidirectional continuous replication.
//!
//! The puller's inserter records each revision it writes; the pusher's
//! change feed skips (and removes) revisions found in the set, so a peer's
//! own revisions are not pushed straight back to it. The set is bounded:
//! when full, the oldest entry is forgotten.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

const MAX_REVS: usize = 250;

#[derive(Default)]
struct EchoSet {
    // docID -> [(revID, time added)]
    revs: HashMap<Vec<u8>, Vec<(Vec<u8>, Instant)>>,
    count: usize,
}

#[derive(Default)]
pub struct EchoCanceler {
    set: Mutex<EchoSet>,
}

impl EchoCanceler {
    pub fn new() -> EchoCanceler {
        EchoCanceler::default()
    }

    pub fn len(&self) -> usize {
        self.set.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a revision just inserted by the puller.
    pub fn add_rev(&self, doc_id: &[u8], rev_id: &[u8]) {
        let mut set = self.set.lock();
        if set.count >= MAX_REVS {
            Self::remove_oldest(&mut set);
        }
        set.revs
            .entry(doc_id.to_vec())
            .or_default()
            .push((rev_id.to_vec(), Instant::now()));
        set.count += 1;
    }

    /// True if the revision was added by the puller; removes it, since the
    /// change feed won't see it again.
    pub fn rev_is_echoed(&self, doc_id: &[u8], rev_id: &[u8]) -> bool {
        let mut set = self.set.lock();
        let Some(revs) = set.revs.get_mut(doc_id) else {
            return false;
        };
        let Some(pos) = revs.iter().position(|(r, _)| r == rev_id) else {
            return false;
        };
        revs.remove(pos);
        if revs.is_empty() {
            set.revs.remove(doc_id);
        }
        set.count -= 1;
        true
    }

    fn remove_oldest(set: &mut EchoSet) {
        let oldest = set
            .revs
            .iter()
            .filter_map(|(doc, revs)| {
                revs.iter()
                    .enumerate()
                    .min_by_key(|(_, (_, t))| *t)
                    .map(|(i, (_, t))| (doc.clone(), i, *t))
            })
            .min_by_key(|(_, _, t)| *t);
        if let Some((doc, index, _)) = oldest {
            debug!(doc = %String::from_utf8_lossy(&doc), "echo set full; forgetting oldest");
            if let Some(revs) = set.revs.get_mut(&doc) {
                revs.remove(index);
                if revs.is_empty() {
                    set.revs.remove(&doc);
                }
                set.count -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_revs_are_echoed_once() {
        let echo = EchoCanceler::new();
        echo.add_rev(b"doc1", b"1-aa");
        assert!(echo.rev_is_echoed(b"doc1", b"1-aa"));
        // Removed as a side effect.
        assert!(!echo.rev_is_echoed(b"doc1", b"1-aa"));
        assert!(echo.is_empty());
    }

    #[test]
    fn unknown_revs_are_not_echoed() {
        let echo = EchoCanceler::new();
        echo.add_rev(b"doc1", b"1-aa");
        assert!(!echo.rev_is_echoed(b"doc1", b"2-bb"));
        assert!(!echo.rev_is_echoed(b"doc2", b"1-aa"));
        assert_eq!(echo.len(), 1);
    }

    #[test]
    fn multiple_revs_per_document() {
        let echo = EchoCanceler::new();
        echo.add_rev(b"doc1", b"1-aa");
        echo.add_rev(b"doc1", b"2-bb");
        assert!(echo.rev_is_echoed(b"doc1", b"2-bb"));
        assert!(echo.rev_is_echoed(b"doc1", b"1-aa"));
    }

    #[test]
    fn overflow_evicts_oldest() {
        let echo = EchoCanceler::new();
        for i in 0..MAX_REVS + 10 {
            echo.add_rev(format!("doc{i}").as_bytes(), b"1-aa");
        }
        assert_eq!(echo.len(), MAX_REVS);
        // The earliest entries were evicted.
        assert!(!echo.rev_is_echoed(b"doc0", b"1-aa"));
        // The most recent entries survive.
        let last = format!("doc{}", MAX_REVS + 9);
        assert!(echo.rev_is_echoed(last.as_bytes(), b"1-aa"));
    }
}
