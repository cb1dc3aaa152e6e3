//! The push side of replication: announce local changes in sequence order,
//! send the revisions the peer asks for, and advance the checkpoint.

use std::sync::Arc;

use rivetdb_blip::{Connection, MessageBuilder};
use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::revid;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::checkpoint::Checkpointer;
use crate::db_access::DbAccess;
use crate::echo::EchoCanceler;
use crate::protocol::*;
use crate::status::StatusHandle;

pub(crate) struct Pusher {
    pub db: DbAccess,
    pub connection: Arc<Connection>,
    pub echo: Arc<EchoCanceler>,
    pub status: StatusHandle,
    /// Present on the active side only; passive pushers don't checkpoint.
    pub checkpointer: Option<Arc<Checkpointer>>,
    pub continuous: bool,
    pub batch_size: usize,
    pub max_history: usize,
    pub since: u64,
    pub cancel: CancellationToken,
}

impl Pusher {
    /// Runs until caught up (one-shot), cancelled, or the connection fails.
    pub async fn run(mut self) -> Result<()> {
        let mut commits = self.continuous.then(|| self.db.subscribe_commits());
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let (entries, last_scanned) = self.db.changes_since(self.since, self.batch_size)?;

            // Drop revisions the puller on this connection inserted.
            let entries: Vec<_> = entries
                .into_iter()
                .filter(|entry| {
                    let compact = revid::compact(entry.rev_id.as_bytes()).unwrap_or_default();
                    !self.echo.rev_is_echoed(entry.doc_id.as_bytes(), &compact)
                })
                .collect();

            if entries.is_empty() {
                if last_scanned > self.since {
                    // Everything in this window was echo-cancelled.
                    self.advance(last_scanned).await?;
                    continue;
                }
                if !self.continuous {
                    // Final empty batch tells the peer we're caught up.
                    let mut done = MessageBuilder::with_profile(PROFILE_CHANGES);
                    done.write(&encode_changes(&[]));
                    self.connection.send_request(done).await?;
                    debug!("push caught up");
                    return Ok(());
                }
                self.status.set_idle();
                let commits = commits.as_mut().expect("continuous mode subscribes");
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    seq = commits.rx.recv() => {
                        if seq.is_none() {
                            return Ok(());
                        }
                        // Coalesce any further pending notifications.
                        while commits.rx.try_recv().is_ok() {}
                        continue;
                    }
                }
            }

            let _busy = self.status.busy();
            self.push_batch(&entries).await?;
            self.advance(last_scanned).await?;
        }
    }

    async fn advance(&mut self, sequence: u64) -> Result<()> {
        self.since = sequence;
        if let Some(checkpointer) = &self.checkpointer {
            checkpointer.advance_local(sequence).await?;
        }
        Ok(())
    }

    async fn push_batch(&self, entries: &[ChangeEntry]) -> Result<()> {
        debug!(count = entries.len(), "announcing changes");
        let mut request = MessageBuilder::with_profile(PROFILE_CHANGES);
        request.write(&encode_changes(entries));
        let response = self.connection.send_request(request).await?;
        let answers = decode_changes_response(response.body())?;
        let max_history = response
            .int_property(PROP_MAX_HISTORY, self.max_history as i64)
            .max(1) as usize;

        // Stream the wanted revisions concurrently; the receiver coalesces
        // them into batched inserts. A failure to deliver one revision
        // doesn't stop the push.
        let sends = entries
            .iter()
            .zip(answers)
            .filter_map(|(entry, answer)| match answer {
                ChangeResponse::Wanted { known_ancestors } => Some(async move {
                    (entry, self.send_rev(entry, &known_ancestors, max_history).await)
                }),
                ChangeResponse::Skip => None,
            });
        for (entry, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => self.status.document_pushed(entry, None),
                Err(e) => {
                    warn!(doc = %entry.doc_id, rev = %entry.rev_id, error = %e, "push failed");
                    self.status.document_pushed(entry, Some(e));
                }
            }
        }
        Ok(())
    }

    async fn send_rev(
        &self,
        entry: &ChangeEntry,
        known_ancestors: &[String],
        max_history: usize,
    ) -> Result<()> {
        let (body, mut history, deleted) =
            match self.db.rev_to_send(&entry.doc_id, &entry.rev_id, max_history) {
                Ok(rev) => rev,
                Err(e @ RivetError::NotFound(_)) => {
                    // Revision vanished (purged or pruned); tell the peer.
                    let mut norev = MessageBuilder::with_profile(PROFILE_NO_REV);
                    norev.add_property(PROP_ID, &entry.doc_id);
                    norev.add_property(PROP_REV, &entry.rev_id);
                    norev.add_int_property(PROP_SEQUENCE, entry.sequence as i64);
                    self.connection.send_request_no_reply(norev)?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

        // No need to send history the peer already has.
        if let Some(cut) = history
            .iter()
            .position(|ancestor| known_ancestors.contains(ancestor))
        {
            history.truncate(cut + 1);
        }

        let mut request = MessageBuilder::with_profile(PROFILE_REV);
        request.compressed = true;
        request.add_property(PROP_ID, &entry.doc_id);
        request.add_property(PROP_REV, &entry.rev_id);
        request.add_int_property(PROP_SEQUENCE, entry.sequence as i64);
        if deleted {
            request.add_int_property(PROP_DELETED, 1);
        }
        if !history.is_empty() {
            request.add_property(PROP_HISTORY, &encode_history(&history));
        }
        request.write(&serde_json::to_vec(&body)?);
        self.connection.send_request(request).await?;
        Ok(())
    }
}
