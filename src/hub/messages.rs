//! Commands understood by the registry actor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use super::connection::{AgentConnection, ConnectionId, PushError};
use super::ingest::Identity;

/// Snapshot of one registered connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Identity,
    pub name: String,
    pub connection: ConnectionId,
    pub last_seen: DateTime<Utc>,
    pub dropped: u64,
}

#[derive(Debug)]
pub enum RegistryCommand {
    /// Bind a fresh connection to its identity, superseding any previous one.
    Register {
        connection: AgentConnection,
        respond_to: oneshot::Sender<()>,
    },

    /// Remove a connection, but only if it is still the current one.
    Deregister {
        identity: Identity,
        id: ConnectionId,
        respond_to: oneshot::Sender<bool>,
    },

    IsConnected {
        identity: Identity,
        respond_to: oneshot::Sender<bool>,
    },

    /// Queue a pre-encoded frame for the agent.
    Push {
        identity: Identity,
        frame: String,
        respond_to: oneshot::Sender<Result<(), PushError>>,
    },

    Connected {
        respond_to: oneshot::Sender<Vec<ConnectionInfo>>,
    },

    /// Close and remove the connection for an identity.
    Disconnect {
        identity: Identity,
        respond_to: oneshot::Sender<bool>,
    },

    /// Evict every connection whose liveness has expired.
    Sweep {
        now: DateTime<Utc>,
        respond_to: oneshot::Sender<Vec<Identity>>,
    },

    /// Close every connection and stop the actor
    Shutdown,
}
