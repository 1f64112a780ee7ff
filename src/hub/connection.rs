//! A single agent connection as seen by the registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::ingest::Target;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id distinguishing successive connections of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Last time anything was heard from the peer, shared between the session
/// reader and the registry.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicI64>);

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(Utc::now().timestamp_millis())))
    }

    pub fn touch(&self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&self, at: DateTime<Utc>) {
        self.0.store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        let millis = self.0.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let idle = now.timestamp_millis() - self.0.load(Ordering::SeqCst);
        idle > window.as_millis() as i64
    }
}

/// The parts of a connection its session tasks hold on to.
#[derive(Debug, Clone)]
pub struct ConnectionLink {
    pub id: ConnectionId,
    pub cancel: CancellationToken,
    pub liveness: Liveness,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("agent is not connected")]
    NotConnected,

    #[error("outbound queue is full")]
    QueueFull,

    #[error("connection is closing")]
    Closed,

    #[error("failed to encode message: {0}")]
    Encode(#[from] crate::protocol::ProtocolError),
}

/// Registry entry for one live agent connection.
#[derive(Debug)]
pub struct AgentConnection {
    pub target: Target,
    link: ConnectionLink,
    outbound: mpsc::Sender<String>,
    dropped: u64,
}

impl AgentConnection {
    /// Create a connection with a bounded outbound queue. The receiver goes to
    /// the session writer.
    pub fn new(target: Target, capacity: usize) -> (Self, ConnectionLink, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));
        let link = ConnectionLink {
            id: ConnectionId::next(),
            cancel: CancellationToken::new(),
            liveness: Liveness::new(),
        };
        let connection = Self {
            target,
            link: link.clone(),
            outbound,
            dropped: 0,
        };
        (connection, link, outbound_rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub fn link(&self) -> &ConnectionLink {
        &self.link
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queue a frame without waiting. A full queue drops the frame and is
    /// counted.
    pub fn try_push(&mut self, frame: String) -> Result<(), PushError> {
        if self.link.cancel.is_cancelled() {
            return Err(PushError::Closed);
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped += 1;
                warn!(
                    target_id = %self.target.identity,
                    dropped = self.dropped,
                    "outbound queue full, dropping message"
                );
                Err(PushError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }

    /// Tear the connection down. Session tasks observe the cancellation, the
    /// writer sends a Close frame and both exit.
    pub fn close(&self) {
        self.link.cancel.cancel();
    }
}
