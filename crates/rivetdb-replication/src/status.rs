//! Observable replicator state: activity level, per-document outcomes, and
//! progress counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use rivetdb_core::error::RivetError;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::protocol::ChangeEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
}

#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    pub activity: Activity,
    pub error: Option<String>,
    pub documents_pushed: u64,
    pub documents_pulled: u64,
}

impl Default for ReplicatorStatus {
    fn default() -> Self {
        ReplicatorStatus {
            activity: Activity::Stopped,
            error: None,
            documents_pushed: 0,
            documents_pulled: 0,
        }
    }
}

/// Outcome of replicating one document revision.
#[derive(Debug, Clone)]
pub struct DocumentEnded {
    pub doc_id: String,
    pub rev_id: String,
    pub pushing: bool,
    pub error: Option<String>,
}

struct StatusInner {
    tx: watch::Sender<ReplicatorStatus>,
    busy: AtomicI64,
    doc_tx: broadcast::Sender<DocumentEnded>,
}

#[derive(Clone)]
pub(crate) struct StatusHandle {
    inner: Arc<StatusInner>,
}

impl StatusHandle {
    pub(crate) fn new() -> (StatusHandle, watch::Receiver<ReplicatorStatus>) {
        let (tx, rx) = watch::channel(ReplicatorStatus::default());
        let (doc_tx, _) = broadcast::channel(64);
        (
            StatusHandle {
                inner: Arc::new(StatusInner {
                    tx,
                    busy: AtomicI64::new(0),
                    doc_tx,
                }),
            },
            rx,
        )
    }

    pub(crate) fn subscribe_documents(&self) -> broadcast::Receiver<DocumentEnded> {
        self.inner.doc_tx.subscribe()
    }

    pub(crate) fn set_activity(&self, activity: Activity, error: Option<String>) {
        debug!(?activity, ?error, "replicator activity");
        self.inner.tx.send_modify(|status| {
            status.activity = activity;
            status.error = error;
        });
    }

    /// Drops to Idle, unless work is still in flight or the replicator has
    /// left the running states.
    pub(crate) fn set_idle(&self) {
        if self.inner.busy.load(Ordering::Acquire) > 0 {
            return;
        }
        self.inner.tx.send_modify(|status| {
            if matches!(status.activity, Activity::Busy | Activity::Idle) {
                status.activity = Activity::Idle;
            }
        });
    }

    /// Marks work in flight for the lifetime of the returned guard.
    pub(crate) fn busy(&self) -> BusyGuard {
        self.inner.busy.fetch_add(1, Ordering::AcqRel);
        self.inner.tx.send_modify(|status| {
            if matches!(status.activity, Activity::Busy | Activity::Idle) {
                status.activity = Activity::Busy;
            }
        });
        BusyGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn document_pushed(&self, entry: &ChangeEntry, error: Option<RivetError>) {
        self.document_ended(&entry.doc_id, &entry.rev_id, true, error);
    }

    pub(crate) fn document_ended(
        &self,
        doc_id: &str,
        rev_id: &str,
        pushing: bool,
        error: Option<RivetError>,
    ) {
        if error.is_none() {
            self.inner.tx.send_modify(|status| {
                if pushing {
                    status.documents_pushed += 1;
                } else {
                    status.documents_pulled += 1;
                }
            });
        }
        let _ = self.inner.doc_tx.send(DocumentEnded {
            doc_id: doc_id.to_string(),
            rev_id: rev_id.to_string(),
            pushing,
            error: error.map(|e| e.to_string()),
        });
    }
}

pub(crate) struct BusyGuard {
    inner: Arc<StatusInner>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.inner.busy.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.tx.send_modify(|status| {
                if status.activity == Activity::Busy {
                    status.activity = Activity::Idle;
                }
            });
        }
    }
}
