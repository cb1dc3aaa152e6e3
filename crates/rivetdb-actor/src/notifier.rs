//! Cross-process change notification.
//!
//! Each database directory holds a small notifier file containing a change
//! counter and the PID of the last writer. A process that commits a change
//! bumps the counter; other processes watching the same file observe the
//! bump and notify their subscribers. Notifications carrying our own PID are
//! ignored. A polling watcher stands in for a process-shared condition
//! variable, keeping the file format trivial and portable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rivetdb_core::error::Result;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const FILE_SIZE: usize = 12; // counter u64 LE + pid u32 LE
const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn read_state(path: &Path) -> (u64, u32) {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() >= FILE_SIZE => {
            let counter = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
            let pid = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
            (counter, pid)
        }
        _ => (0, 0),
    }
}

/// Watches and bumps a shared notifier file.
pub struct CrossProcessNotifier {
    path: PathBuf,
    last_seen: Mutex<u64>,
    tx: broadcast::Sender<()>,
    cancel: CancellationToken,
}

impl CrossProcessNotifier {
    /// Opens (creating if needed) the notifier file and starts watching it.
    pub fn open(path: impl Into<PathBuf>) -> Result<std::sync::Arc<Self>> {
        let path = path.into();
        if !path.exists() {
            std::fs::write(&path, [0u8; FILE_SIZE])?;
        }
        let (counter, _) = read_state(&path);
        let (tx, _) = broadcast::channel(16);
        let notifier = std::sync::Arc::new(CrossProcessNotifier {
            path,
            last_seen: Mutex::new(counter),
            tx,
            cancel: CancellationToken::new(),
        });

        let watcher = notifier.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => watcher.check(),
                    _ = watcher.cancel.cancelled() => break,
                }
            }
            debug!(path = %watcher.path.display(), "notifier watcher stopped");
        });
        Ok(notifier)
    }

    /// Announces a local change to other processes.
    pub fn notify(&self) -> Result<()> {
        let (counter, _) = read_state(&self.path);
        let next = counter.wrapping_add(1);
        *self.last_seen.lock() = next; // don't re-deliver our own bump
        let mut bytes = Vec::with_capacity(FILE_SIZE);
        bytes.extend_from_slice(&next.to_le_bytes());
        bytes.extend_from_slice(&std::process::id().to_le_bytes());
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Subscribes to notifications from *other* processes.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    fn check(&self) {
        let (counter, pid) = read_state(&self.path);
        let mut last = self.last_seen.lock();
        if counter != *last {
            *last = counter;
            if pid != std::process::id() {
                let _ = self.tx.send(()); // ignore "no subscribers"
            } else {
                warn!("notifier counter moved under our own PID");
            }
        }
    }
}

impl Drop for CrossProcessNotifier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn own_notifications_are_not_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = CrossProcessNotifier::open(dir.path().join("notifier")).unwrap();
        let mut rx = notifier.subscribe();
        notifier.notify().unwrap();
        tokio::time::sleep(POLL_INTERVAL * 2).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn foreign_bump_is_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notifier");
        let notifier = CrossProcessNotifier::open(&path).unwrap();
        let mut rx = notifier.subscribe();

        // Simulate another process: different PID in the file.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&99u64.to_le_bytes());
        bytes.extend_from_slice(&(std::process::id() ^ 1).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(got.is_ok(), "expected a cross-process notification");
        notifier.stop();
    }
}
