//! RegistryActor - Owns the identity → connection map
//!
//! All mutation goes through this one task, so registration, teardown and
//! eviction are serialized without a shared lock.
//!
//! ## Invariants
//!
//! - At most one live connection per identity. Registering a second one
//!   closes the first before the new entry becomes visible.
//! - A connection can only deregister itself. A superseded session that
//!   finishes late carries a stale [`ConnectionId`] and leaves its
//!   successor alone.
//! - Every removal closes the connection, so no entry outlives its transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, trace};

use crate::protocol::{Envelope, Payload};

use super::connection::{AgentConnection, ConnectionId, PushError};
use super::ingest::{Identity, IngestionSink, TargetStatus};
use super::messages::{ConnectionInfo, RegistryCommand};

pub struct RegistryActor {
    connections: HashMap<Identity, AgentConnection>,
    sink: Arc<dyn IngestionSink>,
    stale_after: Duration,
    command_rx: mpsc::Receiver<RegistryCommand>,
}

impl RegistryActor {
    pub fn new(
        command_rx: mpsc::Receiver<RegistryCommand>,
        sink: Arc<dyn IngestionSink>,
        stale_after: Duration,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            sink,
            stale_after,
            command_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting registry actor");

        while let Some(command) = self.command_rx.recv().await {
            match command {
                RegistryCommand::Register {
                    connection,
                    respond_to,
                } => {
                    self.register(connection).await;
                    let _ = respond_to.send(());
                }
                RegistryCommand::Deregister {
                    identity,
                    id,
                    respond_to,
                } => {
                    let removed = self.deregister(&identity, id).await;
                    let _ = respond_to.send(removed);
                }
                RegistryCommand::IsConnected {
                    identity,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.connections.contains_key(&identity));
                }
                RegistryCommand::Push {
                    identity,
                    frame,
                    respond_to,
                } => {
                    let result = match self.connections.get_mut(&identity) {
                        Some(connection) => connection.try_push(frame),
                        None => Err(PushError::NotConnected),
                    };
                    let _ = respond_to.send(result);
                }
                RegistryCommand::Connected { respond_to } => {
                    let _ = respond_to.send(self.snapshot());
                }
                RegistryCommand::Disconnect {
                    identity,
                    respond_to,
                } => {
                    let current = self.connections.get(&identity).map(AgentConnection::id);
                    let removed = match current {
                        Some(id) => self.deregister(&identity, id).await,
                        None => false,
                    };
                    let _ = respond_to.send(removed);
                }
                RegistryCommand::Sweep { now, respond_to } => {
                    let evicted = self.sweep(now).await;
                    let _ = respond_to.send(evicted);
                }
                RegistryCommand::Shutdown => {
                    info!("registry shutting down");
                    break;
                }
            }
        }

        for (_, connection) in self.connections.drain() {
            connection.close();
        }
        debug!("registry actor stopped");
    }

    async fn register(&mut self, connection: AgentConnection) {
        let identity = connection.target.identity.clone();
        let id = connection.id();

        if let Some(previous) = self.connections.insert(identity.clone(), connection) {
            info!(
                target_id = %identity,
                old = %previous.id(),
                new = %id,
                "superseding existing connection"
            );
            previous.close();
        } else {
            info!(target_id = %identity, connection = %id, "agent connected");
        }

        self.update_status(&identity, TargetStatus::Online).await;
    }

    async fn deregister(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        match self.connections.get(identity) {
            Some(current) if current.id() == id => {}
            Some(current) => {
                trace!(
                    target_id = %identity,
                    stale = %id,
                    current = %current.id(),
                    "ignoring deregister of superseded connection"
                );
                return false;
            }
            None => return false,
        }

        if let Some(connection) = self.connections.remove(identity) {
            connection.close();
        }
        info!(target_id = %identity, connection = %id, "agent disconnected");
        self.update_status(identity, TargetStatus::Offline).await;
        true
    }

    async fn sweep(&mut self, now: DateTime<Utc>) -> Vec<Identity> {
        let stale: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.link().liveness.is_stale(now, self.stale_after))
            .map(|(identity, _)| identity.clone())
            .collect();

        for identity in &stale {
            if let Some(connection) = self.connections.remove(identity) {
                info!(
                    target_id = %identity,
                    last_seen = %connection.link().liveness.last_seen(),
                    "evicting stale connection"
                );
                connection.close();
            }
            self.update_status(identity, TargetStatus::Offline).await;
        }

        stale
    }

    fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut connected: Vec<ConnectionInfo> = self
            .connections
            .values()
            .map(|connection| ConnectionInfo {
                id: connection.target.identity.clone(),
                name: connection.target.name.clone(),
                connection: connection.id(),
                last_seen: connection.link().liveness.last_seen(),
                dropped: connection.dropped(),
            })
            .collect();
        connected.sort_by(|a, b| a.id.cmp(&b.id));
        connected
    }

    async fn update_status(&self, identity: &Identity, status: TargetStatus) {
        if let Err(e) = self.sink.set_status(identity, status).await {
            error!(target_id = %identity, "failed to update status: {e}");
        }
    }
}

/// Handle for talking to the registry actor
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn spawn(sink: Arc<dyn IngestionSink>, stale_after: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = RegistryActor::new(cmd_rx, sink, stale_after);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
        name: &str,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(command(tx))
            .await
            .with_context(|| format!("failed to send {name} command"))?;
        rx.await.context("failed to receive response")
    }

    pub async fn register(&self, connection: AgentConnection) -> Result<()> {
        self.request(
            |respond_to| RegistryCommand::Register {
                connection,
                respond_to,
            },
            "Register",
        )
        .await
    }

    /// Remove `identity` if `id` is still its current connection.
    pub async fn deregister(&self, identity: Identity, id: ConnectionId) -> Result<bool> {
        self.request(
            |respond_to| RegistryCommand::Deregister {
                identity,
                id,
                respond_to,
            },
            "Deregister",
        )
        .await
    }

    pub async fn is_connected(&self, identity: &Identity) -> Result<bool> {
        let identity = identity.clone();
        self.request(
            |respond_to| RegistryCommand::IsConnected {
                identity,
                respond_to,
            },
            "IsConnected",
        )
        .await
    }

    /// Queue a message for a connected agent without waiting for room.
    pub async fn push(&self, identity: &Identity, payload: Payload) -> Result<(), PushError> {
        let frame = Envelope::new(String::new(), identity.to_string(), payload).encode()?;
        let identity = identity.clone();
        self.request(
            |respond_to| RegistryCommand::Push {
                identity,
                frame,
                respond_to,
            },
            "Push",
        )
        .await
        .map_err(|_| PushError::Closed)?
    }

    pub async fn connected(&self) -> Result<Vec<ConnectionInfo>> {
        self.request(
            |respond_to| RegistryCommand::Connected { respond_to },
            "Connected",
        )
        .await
    }

    pub async fn disconnect(&self, identity: &Identity) -> Result<bool> {
        let identity = identity.clone();
        self.request(
            |respond_to| RegistryCommand::Disconnect {
                identity,
                respond_to,
            },
            "Disconnect",
        )
        .await
    }

    /// Evict stale connections as of `now`; returns who was evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Identity>> {
        self.request(
            |respond_to| RegistryCommand::Sweep { now, respond_to },
            "Sweep",
        )
        .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RegistryCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
