//! Push/pull replication between two RivetDB databases over BLIP.
//!
//! The active side drives the session: it connects, fetches checkpoints,
//! announces local changes (push), subscribes to the peer's changes (pull),
//! and retries with exponential backoff after recoverable failures. The
//! passive side answers checkpoint requests, serves `subChanges`
//! subscriptions, and accepts pushed revisions.

pub mod checkpoint;
pub mod db_access;
pub mod echo;
pub mod protocol;
mod puller;
mod pusher;
mod status;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rivetdb_blip::{Connection, MessageBuilder, Transport};
use rivetdb_core::error::{Result, RivetError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpointer;
use crate::db_access::{Checkpoint, DbAccess};
use crate::echo::EchoCanceler;
use crate::protocol::*;
use crate::puller::{Inserter, PullState, register_incoming, subscribe_to_changes};
use crate::pusher::Pusher;
use crate::status::StatusHandle;

pub use crate::db_access::{BlobAccess, RevToInsert};
pub use crate::status::{Activity, DocumentEnded, ReplicatorStatus};

/// Produces a fresh transport for each connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

#[derive(Debug, Clone)]
pub struct ReplicatorOptions {
    pub push: bool,
    pub pull: bool,
    /// Keep running (and retrying) after catching up.
    pub continuous: bool,
    /// Peer identity, part of the checkpoint ID (e.g. a URL).
    pub remote_name: String,
    /// Refuse pulled revisions that would create a new conflict.
    pub no_conflicts: bool,
    pub batch_size: usize,
    pub max_history: usize,
}

impl ReplicatorOptions {
    pub fn push_and_pull(remote_name: impl Into<String>) -> ReplicatorOptions {
        ReplicatorOptions {
            push: true,
            pull: true,
            continuous: false,
            remote_name: remote_name.into(),
            no_conflicts: false,
            batch_size: 200,
            max_history: 20,
        }
    }

    pub fn push_only(remote_name: impl Into<String>) -> ReplicatorOptions {
        ReplicatorOptions {
            pull: false,
            ..Self::push_and_pull(remote_name)
        }
    }

    pub fn pull_only(remote_name: impl Into<String>) -> ReplicatorOptions {
        ReplicatorOptions {
            push: false,
            ..Self::push_and_pull(remote_name)
        }
    }
}

/// A connector that hands out one pre-established transport, then fails.
/// Useful for loopback replication and tests; reconnection needs a real
/// connector.
pub struct SingleUseConnector(parking_lot::Mutex<Option<Box<dyn Transport>>>);

impl SingleUseConnector {
    pub fn new(transport: impl Transport + 'static) -> Box<SingleUseConnector> {
        Box::new(SingleUseConnector(parking_lot::Mutex::new(Some(Box::new(
            transport,
        )))))
    }
}

#[async_trait]
impl Connector for SingleUseConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.0
            .lock()
            .take()
            .ok_or(RivetError::Network(rivetdb_core::NetworkError::Timeout))
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64 << attempt.min(8); // 1, 2, 4, ... capped
    Duration::from_secs(secs).min(MAX_RETRY_DELAY)
}

// ---------------------------------------------------------------------------
// Active replicator
// ---------------------------------------------------------------------------

pub struct Replicator {
    status_rx: watch::Receiver<ReplicatorStatus>,
    status: StatusHandle,
    cancel: CancellationToken,
}

impl Replicator {
    /// Starts replicating on the current tokio runtime.
    pub fn start(
        db: DbAccess,
        connector: Box<dyn Connector>,
        options: ReplicatorOptions,
    ) -> Replicator {
        let (status, status_rx) = StatusHandle::new();
        let cancel = CancellationToken::new();
        let driver = Driver {
            db,
            connector,
            options,
            status: status.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run());
        Replicator {
            status_rx,
            status,
            cancel,
        }
    }

    pub fn status(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status_rx.clone()
    }

    /// Per-document outcomes, as they complete.
    pub fn document_events(&self) -> broadcast::Receiver<DocumentEnded> {
        self.status.subscribe_documents()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the replicator reaches `Stopped`.
    pub async fn wait_stopped(&self) -> ReplicatorStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let current = rx.borrow().clone();
            if current.activity == Activity::Stopped {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum SessionEnd {
    CaughtUp,
    Cancelled,
    Failed(RivetError),
}

struct Driver {
    db: DbAccess,
    connector: Box<dyn Connector>,
    options: ReplicatorOptions,
    status: StatusHandle,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                self.status.set_activity(Activity::Stopped, None);
                return;
            }
            self.status.set_activity(Activity::Connecting, None);
            let outcome = match self.connector.connect().await {
                Ok(transport) => self.run_session(transport).await,
                Err(e) => SessionEnd::Failed(e),
            };
            match outcome {
                SessionEnd::CaughtUp => {
                    info!("replication caught up");
                    self.status.set_activity(Activity::Stopped, None);
                    return;
                }
                SessionEnd::Cancelled => {
                    self.status.set_activity(Activity::Stopped, None);
                    return;
                }
                SessionEnd::Failed(e) => {
                    if self.options.continuous && e.is_transient() {
                        attempt += 1;
                        let delay = backoff_delay(attempt);
                        warn!(error = %e, ?delay, "replication offline; will retry");
                        self.status
                            .set_activity(Activity::Offline, Some(e.to_string()));
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = self.cancel.cancelled() => {
                                self.status.set_activity(Activity::Stopped, None);
                                return;
                            }
                        }
                    }
                    warn!(error = %e, "replication stopped on error");
                    self.status
                        .set_activity(Activity::Stopped, Some(e.to_string()));
                    return;
                }
            }
        }
    }

    async fn run_session(&self, transport: Box<dyn Transport>) -> SessionEnd {
        let connection = Connection::start(transport, "replicator");
        let echo = Arc::new(EchoCanceler::new());

        // Peers may fetch referenced blobs from us while we push.
        if self.options.push {
            register_attachment_handler(&connection, &self.db);
        }

        let checkpointer = Arc::new(Checkpointer::new(
            self.db.clone(),
            connection.clone(),
            &self.options.remote_name,
        ));
        let checkpoint = match checkpointer.fetch().await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                connection.close();
                return SessionEnd::Failed(e);
            }
        };
        self.status.set_activity(Activity::Busy, None);

        let pull_state = Arc::new(PullState::default());
        if self.options.pull {
            let inserter = Inserter::new(
                self.db.clone(),
                self.options.no_conflicts,
                echo.clone(),
                self.status.clone(),
                pull_state.clone(),
                Some(checkpointer.clone()),
            );
            register_incoming(
                &connection,
                self.db.clone(),
                inserter,
                pull_state.clone(),
                self.status.clone(),
                self.options.max_history,
            );
            if let Err(e) =
                subscribe_to_changes(&connection, checkpoint.remote_sequence(), self.options.continuous)
                    .await
            {
                connection.close();
                return SessionEnd::Failed(e);
            }
        } else {
            pull_state.mark_final();
        }

        let push_task = if self.options.push {
            let pusher = Pusher {
                db: self.db.clone(),
                connection: connection.clone(),
                echo,
                status: self.status.clone(),
                checkpointer: Some(checkpointer.clone()),
                continuous: self.options.continuous,
                batch_size: self.options.batch_size,
                max_history: self.options.max_history,
                since: checkpoint.local,
                cancel: self.cancel.clone(),
            };
            Some(tokio::spawn(pusher.run()))
        } else {
            None
        };

        let caught_up = async {
            pull_state.wait_caught_up().await;
            match push_task {
                Some(task) => match task.await {
                    Ok(result) => result,
                    Err(_) => Err(RivetError::UnexpectedError("push task panicked".into())),
                },
                None => Ok(()),
            }
        };

        let end = tokio::select! {
            _ = self.cancel.cancelled() => SessionEnd::Cancelled,
            _ = connection.wait_closed() => {
                SessionEnd::Failed(RivetError::Network(
                    rivetdb_core::NetworkError::ConnectionReset("connection closed".into()),
                ))
            }
            result = caught_up => {
                match result {
                    Ok(()) => {
                        // Persist how far the pull got before declaring done.
                        let remote = pull_state.highest_remote();
                        if self.options.pull && remote > 0 {
                            if let Err(e) = checkpointer
                                .advance_remote(serde_json::json!(remote))
                                .await
                            {
                                warn!(error = %e, "final pull checkpoint save failed");
                            }
                        }
                        if self.options.continuous {
                            // Caught up but staying live: idle until closed
                            // or cancelled.
                            self.status.set_idle();
                            tokio::select! {
                                _ = self.cancel.cancelled() => SessionEnd::Cancelled,
                                _ = connection.wait_closed() => SessionEnd::Failed(
                                    RivetError::Network(rivetdb_core::NetworkError::ConnectionReset(
                                        "connection closed".into(),
                                    )),
                                ),
                            }
                        } else {
                            SessionEnd::CaughtUp
                        }
                    }
                    Err(e) => SessionEnd::Failed(e),
                }
            }
        };
        connection.close();
        end
    }
}

// ---------------------------------------------------------------------------
// Passive listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub no_conflicts: bool,
    pub batch_size: usize,
    pub max_history: usize,
}

impl Default for ServeOptions {
    fn default() -> Self {
        ServeOptions {
            no_conflicts: false,
            batch_size: 200,
            max_history: 20,
        }
    }
}

const REMOTE_CHECKPOINT_PREFIX: &str = "remote-checkpoint";

/// Registers the passive (server) side of the protocol on a connection:
/// checkpoint storage, `subChanges` service, pushed-revision intake, and
/// blob serving.
pub fn serve(db: DbAccess, connection: &Arc<Connection>, options: ServeOptions) {
    let (status, _status_rx) = StatusHandle::new();
    status.set_activity(Activity::Idle, None);
    let echo = Arc::new(EchoCanceler::new());

    // Checkpoint storage for the peer.
    let checkpoint_db = db.clone();
    connection.on_request(PROFILE_GET_CHECKPOINT, move |message, responder| {
        let client = message.property(PROP_CLIENT).unwrap_or("");
        match checkpoint_db.read_checkpoint(REMOTE_CHECKPOINT_PREFIX, client) {
            Ok(Some((checkpoint, rev))) => {
                let mut reply = MessageBuilder::request();
                reply.add_property(PROP_REV, &rev);
                reply.write(&serde_json::to_vec(&checkpoint).unwrap_or_default());
                responder.respond(reply);
            }
            Ok(None) => responder.respond_error("RivetDB", 1, "no checkpoint"),
            Err(e) => responder.respond_error(e.domain().as_str(), e.code(), &e.to_string()),
        }
    });

    let set_checkpoint_db = db.clone();
    connection.on_request(PROFILE_SET_CHECKPOINT, move |message, responder| {
        let client = message.property(PROP_CLIENT).unwrap_or("").to_string();
        let rev = message.property(PROP_REV).map(str::to_string);
        let checkpoint: Checkpoint = match serde_json::from_slice(message.body()) {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                responder.respond_error("RivetDB", 12, &e.to_string());
                return;
            }
        };
        match set_checkpoint_db.write_checkpoint(
            REMOTE_CHECKPOINT_PREFIX,
            &client,
            &checkpoint,
            rev.as_deref(),
        ) {
            Ok(new_rev) => {
                let mut reply = MessageBuilder::request();
                reply.add_property(PROP_REV, &new_rev);
                responder.respond(reply);
            }
            Err(e) => responder.respond_error(e.domain().as_str(), e.code(), &e.to_string()),
        }
    });

    // Serve subscriptions: spawn a pusher per subChanges request.
    let sub_db = db.clone();
    let sub_echo = echo.clone();
    let sub_status = status.clone();
    let sub_options = options.clone();
    let sub_connection = Arc::downgrade(connection);
    connection.on_request(PROFILE_SUB_CHANGES, move |message, responder| {
        let Some(connection) = sub_connection.upgrade() else {
            return;
        };
        let since = message.int_property(PROP_SINCE, 0) as u64;
        let continuous = message.property(PROP_CONTINUOUS) == Some("true");
        debug!(since, continuous, "peer subscribed to changes");

        // Stop pushing when the connection goes away.
        let cancel = CancellationToken::new();
        let watcher = connection.clone();
        let watched = cancel.clone();
        tokio::spawn(async move {
            watcher.wait_closed().await;
            watched.cancel();
        });

        let pusher = Pusher {
            db: sub_db.clone(),
            connection,
            echo: sub_echo.clone(),
            status: sub_status.clone(),
            checkpointer: None,
            continuous,
            batch_size: sub_options.batch_size,
            max_history: sub_options.max_history,
            since,
            cancel,
        };
        tokio::spawn(async move {
            if let Err(e) = pusher.run().await {
                debug!(error = %e, "serve-side push ended");
            }
        });
        responder.ok();
    });

    // Pushed-revision intake.
    let pull_state = Arc::new(PullState::default());
    let inserter = Inserter::new(
        db.clone(),
        options.no_conflicts,
        echo,
        status.clone(),
        pull_state.clone(),
        None,
    );
    register_incoming(
        connection,
        db.clone(),
        inserter,
        pull_state,
        status,
        options.max_history,
    );

    register_attachment_handler(connection, &db);
}

fn register_attachment_handler(connection: &Arc<Connection>, db: &DbAccess) {
    let blobs = db.blobs().cloned();
    connection.on_request(PROFILE_GET_ATTACHMENT, move |message, responder| {
        let Some(blobs) = &blobs else {
            responder.respond_error("RivetDB", 1, "no blob store");
            return;
        };
        let digest = message.property(PROP_DIGEST).unwrap_or("");
        match blobs.get_blob(digest) {
            Ok(data) => {
                let mut reply = MessageBuilder::request();
                reply.write(&data);
                responder.respond(reply);
            }
            Err(e) => responder.respond_error(e.domain().as_str(), e.code(), &e.to_string()),
        }
    });
}
