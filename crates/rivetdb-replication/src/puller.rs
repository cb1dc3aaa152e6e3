//! The pull side of replication: answer the peer's `changes` announcements
//! with the revisions we want, stage incoming `rev` messages, and insert
//! them in coalesced batches.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rivetdb_actor::{Actor, ActorExt, Mailbox};
use rivetdb_blip::{Connection, MessageBuilder, MessageIn, Responder};
use rivetdb_core::error::{Result, RivetError};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::checkpoint::Checkpointer;
use crate::db_access::{DbAccess, RevToInsert};
use crate::echo::EchoCanceler;
use crate::protocol::*;
use crate::status::StatusHandle;

const FLUSH_DELAY: Duration = Duration::from_millis(50);
const MAX_BATCH: usize = 200;

// ---------------------------------------------------------------------------
// Pull progress
// ---------------------------------------------------------------------------

/// Tracks outstanding revisions and the catch-up signal (the peer sends an
/// empty `changes` message when its feed is drained).
#[derive(Default)]
pub(crate) struct PullState {
    pending: AtomicUsize,
    saw_final_changes: AtomicBool,
    highest_remote: AtomicU64,
    notify: Notify,
}

impl PullState {
    pub(crate) fn add_pending(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn rev_done(&self, remote_sequence: u64) {
        self.highest_remote.fetch_max(remote_sequence, Ordering::AcqRel);
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn mark_final(&self) {
        self.saw_final_changes.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn highest_remote(&self) -> u64 {
        self.highest_remote.load(Ordering::Acquire)
    }

    fn is_caught_up(&self) -> bool {
        self.saw_final_changes.load(Ordering::Acquire)
            && self.pending.load(Ordering::Acquire) == 0
    }

    /// Resolves once the peer's feed is drained and every staged revision
    /// has been inserted.
    pub(crate) async fn wait_caught_up(&self) {
        loop {
            if self.is_caught_up() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_caught_up() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Inserter
// ---------------------------------------------------------------------------

struct PendingRev {
    rev: RevToInsert,
    responder: Responder,
}

/// Staged-revision writer: coalesces incoming revisions into one
/// transaction per flush, amortizing the commit cost. Runs on its own
/// mailbox, so inserts are serialized without blocking the connection.
pub(crate) struct Inserter {
    mailbox: Mailbox,
    db: DbAccess,
    no_conflicts: bool,
    echo: Arc<EchoCanceler>,
    status: StatusHandle,
    state: Arc<PullState>,
    checkpointer: Option<Arc<Checkpointer>>,
    batch: Mutex<Vec<PendingRev>>,
    flush_scheduled: AtomicBool,
}

impl Actor for Inserter {
    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

impl Inserter {
    pub(crate) fn new(
        db: DbAccess,
        no_conflicts: bool,
        echo: Arc<EchoCanceler>,
        status: StatusHandle,
        state: Arc<PullState>,
        checkpointer: Option<Arc<Checkpointer>>,
    ) -> Arc<Inserter> {
        Arc::new(Inserter {
            mailbox: Mailbox::new("inserter"),
            db,
            no_conflicts,
            echo,
            status,
            state,
            checkpointer,
            batch: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
        })
    }

    pub(crate) fn add(self: &Arc<Self>, rev: RevToInsert, responder: Responder) {
        self.enqueue_self(move |this| {
            let size = {
                let mut batch = this.batch.lock();
                batch.push(PendingRev { rev, responder });
                batch.len()
            };
            if size >= MAX_BATCH {
                this.flush();
            } else if !this.flush_scheduled.swap(true, Ordering::AcqRel) {
                this.enqueue_self_after(FLUSH_DELAY, |this| {
                    this.flush_scheduled.store(false, Ordering::Release);
                    this.flush();
                });
            }
        });
    }

    // Inserts the staged batch in one transaction. Individual failures are
    // reported per document and don't abort the rest of the batch.
    fn flush(self: &Arc<Self>) {
        let batch = std::mem::take(&mut *self.batch.lock());
        if batch.is_empty() {
            return;
        }
        let _busy = self.status.busy();
        debug!(count = batch.len(), "inserting pulled revisions");

        let mut outcomes: Vec<(PendingRev, Option<RivetError>)> = Vec::new();
        match self.db.data_file().begin_transaction() {
            Ok(mut txn) => {
                for pending in batch {
                    let result = self.db.insert_revision(
                        &pending.rev,
                        self.no_conflicts,
                        Some(&self.echo),
                        &mut txn,
                    );
                    outcomes.push((pending, result.err()));
                }
                if let Err(e) = txn.commit() {
                    warn!(error = %e, "insert batch commit failed");
                    let message = e.to_string();
                    for (_, outcome) in &mut outcomes {
                        if outcome.is_none() {
                            *outcome = Some(RivetError::UnexpectedError(message.clone()));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "insert batch could not open transaction");
                let message = e.to_string();
                outcomes = batch
                    .into_iter()
                    .map(|p| (p, Some(RivetError::UnexpectedError(message.clone()))))
                    .collect();
            }
        }

        for (pending, error) in outcomes {
            match &error {
                None => pending.responder.ok(),
                Some(e) => {
                    pending
                        .responder
                        .respond_error(e.domain().as_str(), e.code(), &e.to_string());
                }
            }
            self.status
                .document_ended(&pending.rev.doc_id, &pending.rev.rev_id, false, error);
            self.state.rev_done(pending.rev.remote_sequence);
        }

        if let Some(checkpointer) = self.checkpointer.clone() {
            let remote = self.state.highest_remote();
            tokio::spawn(async move {
                if let Err(e) = checkpointer.advance_remote(serde_json::json!(remote)).await {
                    warn!(error = %e, "pull checkpoint save failed");
                }
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Registers the handlers that receive a peer's push: `changes`, `rev`, and
/// `norev`. Used by both the active puller and the passive listener.
pub(crate) fn register_incoming(
    connection: &Arc<Connection>,
    db: DbAccess,
    inserter: Arc<Inserter>,
    state: Arc<PullState>,
    status: StatusHandle,
    max_history: usize,
) {
    let changes_db = db.clone();
    let changes_state = state.clone();
    connection.on_request(PROFILE_CHANGES, move |message, responder| {
        handle_changes(&changes_db, &changes_state, max_history, &message, responder);
    });

    let rev_connection = Arc::downgrade(connection);
    let rev_db = db.clone();
    let rev_state = state.clone();
    let rev_status = status.clone();
    connection.on_request(PROFILE_REV, move |message, responder| {
        match parse_rev_message(&message) {
            Ok(rev) => {
                stage_rev(
                    &rev_db,
                    &rev_connection,
                    &inserter,
                    &rev_state,
                    &rev_status,
                    rev,
                    responder,
                );
            }
            Err(e) => {
                warn!(error = %e, "bad rev message");
                responder.respond_error(e.domain().as_str(), e.code(), &e.to_string());
            }
        }
    });

    connection.on_request(PROFILE_NO_REV, move |message, _responder| {
        let doc_id = message.property(PROP_ID).unwrap_or("").to_string();
        let rev_id = message.property(PROP_REV).unwrap_or("").to_string();
        let sequence = message.int_property(PROP_SEQUENCE, 0) as u64;
        debug!(doc = %doc_id, rev = %rev_id, "peer can't send revision");
        status.document_ended(
            &doc_id,
            &rev_id,
            false,
            Some(RivetError::NotFound("revision unavailable on peer".into())),
        );
        state.rev_done(sequence);
    });
}

fn handle_changes(
    db: &DbAccess,
    state: &Arc<PullState>,
    max_history: usize,
    message: &MessageIn,
    responder: Responder,
) {
    let entries = match decode_changes(message.body()) {
        Ok(entries) => entries,
        Err(e) => {
            responder.respond_error(e.domain().as_str(), e.code(), &e.to_string());
            return;
        }
    };
    if entries.is_empty() {
        state.mark_final();
        let mut reply = MessageBuilder::request();
        reply.write(&encode_changes_response(&[]));
        responder.respond(reply);
        return;
    }

    let mut answers = Vec::with_capacity(entries.len());
    let mut wanted = 0usize;
    for entry in &entries {
        let known = db.has_revision(&entry.doc_id, &entry.rev_id).unwrap_or(false);
        if known {
            // Already present; still counts toward pull progress.
            state.highest_remote.fetch_max(entry.sequence, Ordering::AcqRel);
            answers.push(ChangeResponse::Skip);
        } else {
            wanted += 1;
            answers.push(ChangeResponse::Wanted {
                known_ancestors: db.known_ancestors(&entry.doc_id).unwrap_or_default(),
            });
        }
    }
    state.add_pending(wanted);
    debug!(total = entries.len(), wanted, "answered changes");

    let mut reply = MessageBuilder::request();
    reply.add_int_property(PROP_MAX_HISTORY, max_history as i64);
    reply.write(&encode_changes_response(&answers));
    responder.respond(reply);
}

fn parse_rev_message(message: &MessageIn) -> Result<RevToInsert> {
    let doc_id = message
        .property(PROP_ID)
        .ok_or_else(|| RivetError::InvalidParameter("rev message missing id".into()))?
        .to_string();
    let rev_id = message
        .property(PROP_REV)
        .ok_or_else(|| RivetError::InvalidParameter("rev message missing rev".into()))?
        .to_string();
    let history = decode_history(message.property(PROP_HISTORY).unwrap_or(""));
    let deleted = message.int_property(PROP_DELETED, 0) != 0;
    let body: serde_json::Value = serde_json::from_slice(message.body())?;
    Ok(RevToInsert {
        doc_id,
        rev_id,
        history,
        deleted,
        body: Some(body),
        remote_sequence: message.int_property(PROP_SEQUENCE, 0) as u64,
    })
}

// Fetches any missing blobs referenced by the revision, then stages it.
fn stage_rev(
    db: &DbAccess,
    connection: &std::sync::Weak<Connection>,
    inserter: &Arc<Inserter>,
    state: &Arc<PullState>,
    status: &StatusHandle,
    rev: RevToInsert,
    responder: Responder,
) {
    let missing = missing_blob_digests(db, &rev);
    if missing.is_empty() {
        inserter.add(rev, responder);
        return;
    }
    let Some(connection) = connection.upgrade() else {
        return; // connection torn down
    };
    let Some(blobs) = db.blobs().cloned() else {
        status.document_ended(
            &rev.doc_id,
            &rev.rev_id,
            false,
            Some(RivetError::NotFound("no blob store".into())),
        );
        state.rev_done(rev.remote_sequence);
        responder.respond_error("RivetDB", 1, "no blob store");
        return;
    };
    let inserter = inserter.clone();
    let state = state.clone();
    let status = status.clone();
    tokio::spawn(async move {
        for digest in missing {
            let mut request = MessageBuilder::with_profile(PROFILE_GET_ATTACHMENT);
            request.add_property(PROP_DIGEST, &digest);
            let outcome = match connection.send_request(request).await {
                Ok(response) => match blobs.put_blob(response.body()) {
                    Ok(stored) if stored == digest => Ok(()),
                    Ok(stored) => Err(RivetError::CryptoError(format!(
                        "blob digest mismatch: wanted {digest}, got {stored}"
                    ))),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(doc = %rev.doc_id, %digest, error = %e, "blob fetch failed");
                status.document_ended(&rev.doc_id, &rev.rev_id, false, Some(e));
                state.rev_done(rev.remote_sequence);
                responder.respond_error("RivetDB", 9, "attachment transfer failed");
                return;
            }
        }
        inserter.add(rev, responder);
    });
}

fn missing_blob_digests(db: &DbAccess, rev: &RevToInsert) -> Vec<String> {
    let Some(blobs) = db.blobs() else {
        return Vec::new();
    };
    let Some(attachments) = rev
        .body
        .as_ref()
        .and_then(|b| b.get("_attachments"))
        .and_then(|a| a.as_object())
    else {
        return Vec::new();
    };
    attachments
        .values()
        .filter_map(|meta| meta.get("digest").and_then(|d| d.as_str()))
        .filter(|digest| !blobs.has_blob(digest))
        .map(str::to_string)
        .collect()
}

/// Asks the peer to start sending its changes.
pub(crate) async fn subscribe_to_changes(
    connection: &Arc<Connection>,
    since: u64,
    continuous: bool,
) -> Result<()> {
    let mut request = MessageBuilder::with_profile(PROFILE_SUB_CHANGES);
    request.add_int_property(PROP_SINCE, since as i64);
    if continuous {
        request.add_property(PROP_CONTINUOUS, "true");
    }
    connection.send_request(request).await?;
    Ok(())
}
