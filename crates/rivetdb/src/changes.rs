//! Change feeds: one-shot catch-up reads plus a live stream fed from
//! committed transactions.

use std::collections::VecDeque;

use tokio::sync::broadcast;

/// One committed document change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub id: String,
    pub rev: String,
    pub deleted: bool,
}

/// A live changes stream: yields the backlog since a starting sequence,
/// then new events as they commit.
pub struct LiveChanges {
    backlog: VecDeque<ChangeEvent>,
    rx: broadcast::Receiver<ChangeEvent>,
    last_sequence: u64,
}

impl LiveChanges {
    pub(crate) fn new(backlog: Vec<ChangeEvent>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        let last_sequence = backlog.last().map(|e| e.sequence).unwrap_or(0);
        LiveChanges {
            backlog: backlog.into(),
            rx,
            last_sequence,
        }
    }

    /// The next change; `None` once the database is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_sequence = self.last_sequence.max(event.sequence);
            return Some(event);
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    // The subscription was opened before the backlog scan, so
                    // events may overlap it; drop anything already delivered.
                    if event.sequence <= self.last_sequence {
                        continue;
                    }
                    self.last_sequence = event.sequence;
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
