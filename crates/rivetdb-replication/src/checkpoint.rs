//! Checkpoint management for an active replicator.
//!
//! Progress is persisted twice: locally in the `info` store, and remotely on
//! the peer via `getCheckpoint`/`setCheckpoint`, both under the same stable
//! checkpoint ID. Each copy carries a revision counter so stale writers are
//! detected. If the two copies disagree at startup the replicator starts
//! over from scratch rather than risk skipping changes.

use std::sync::Arc;

use rivetdb_blip::{Connection, MessageBuilder};
use rivetdb_core::error::{Result, RivetError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::db_access::{Checkpoint, DbAccess};
use crate::protocol::*;

const LOCAL_PREFIX: &str = "checkpoint";

struct State {
    checkpoint: Checkpoint,
    local_rev: Option<String>,
    remote_rev: Option<String>,
}

pub struct Checkpointer {
    db: DbAccess,
    connection: Arc<Connection>,
    id: String,
    state: Mutex<State>,
}

impl Checkpointer {
    pub fn new(db: DbAccess, connection: Arc<Connection>, remote_name: &str) -> Checkpointer {
        let id = db.checkpoint_id(remote_name);
        Checkpointer {
            db,
            connection,
            id,
            state: Mutex::new(State {
                checkpoint: Checkpoint::default(),
                local_rev: None,
                remote_rev: None,
            }),
        }
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.id
    }

    /// Loads both copies and reconciles them. Returns the starting point.
    pub async fn fetch(&self) -> Result<Checkpoint> {
        let local = self.db.read_checkpoint(LOCAL_PREFIX, &self.id)?;

        let mut request = MessageBuilder::with_profile(PROFILE_GET_CHECKPOINT);
        request.add_property(PROP_CLIENT, &self.id);
        let remote = match self.connection.send_request(request).await {
            Ok(response) => {
                let checkpoint: Checkpoint = serde_json::from_slice(response.body())?;
                let rev = response.property(PROP_REV).unwrap_or("").to_string();
                Some((checkpoint, rev))
            }
            Err(RivetError::RemoteError { code, .. }) if code == 1 || code == 404 => None,
            Err(e) => return Err(e),
        };

        let mut state = self.state.lock().await;
        state.local_rev = local.as_ref().map(|(_, rev)| rev.clone());
        state.remote_rev = remote.as_ref().map(|(_, rev)| rev.clone());
        state.checkpoint = match (local, remote) {
            (Some((local, _)), Some((remote, _))) => {
                if local == remote {
                    local
                } else {
                    warn!(id = %self.id, "checkpoint mismatch; starting over");
                    Checkpoint::default()
                }
            }
            (Some((local, _)), None) => local,
            (None, Some((remote, _))) => remote,
            (None, None) => Checkpoint::default(),
        };
        debug!(id = %self.id, local = state.checkpoint.local, "checkpoint fetched");
        Ok(state.checkpoint.clone())
    }

    pub async fn current(&self) -> Checkpoint {
        self.state.lock().await.checkpoint.clone()
    }

    /// Advances the pushed-sequence marker and persists both copies.
    pub async fn advance_local(&self, sequence: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        if sequence <= state.checkpoint.local {
            return Ok(());
        }
        state.checkpoint.local = sequence;
        self.save(&mut state).await
    }

    /// Advances the pulled-sequence marker and persists both copies.
    pub async fn advance_remote(&self, remote: serde_json::Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.checkpoint.remote = remote;
        self.save(&mut state).await
    }

    async fn save(&self, state: &mut State) -> Result<()> {
        let new_local_rev = self.db.write_checkpoint(
            LOCAL_PREFIX,
            &self.id,
            &state.checkpoint,
            state.local_rev.as_deref(),
        )?;
        state.local_rev = Some(new_local_rev);

        let mut request = MessageBuilder::with_profile(PROFILE_SET_CHECKPOINT);
        request.add_property(PROP_CLIENT, &self.id);
        if let Some(rev) = &state.remote_rev {
            request.add_property(PROP_REV, rev);
        }
        request.write(&serde_json::to_vec(&state.checkpoint)?);
        let response = self.connection.send_request(request).await?;
        state.remote_rev = response.property(PROP_REV).map(str::to_string);
        debug!(
            id = %self.id,
            local = state.checkpoint.local,
            "checkpoint saved"
        );
        Ok(())
    }
}
