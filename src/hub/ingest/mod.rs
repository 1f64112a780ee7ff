//! Boundary between the live link and whatever stores and resolves targets.
//!
//! The session handler only ever talks to these traits; [`memory::MemoryStore`]
//! is the in-process implementation the hub binary ships with.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StatusThresholds;
use crate::{AlertEvent, MetricSample};

pub use memory::MemoryStore;

/// Stable identifier of a monitored target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A target as resolved from its credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub identity: Identity,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Online,
    #[default]
    Offline,
    Warning,
}

/// `warning` when any resource is strictly above its limit, `online` otherwise.
pub fn derive_status(sample: &MetricSample, thresholds: &StatusThresholds) -> TargetStatus {
    if sample.cpu.usage > thresholds.cpu
        || sample.memory.used_percent > thresholds.memory
        || sample.disk.used_percent > thresholds.disk
    {
        TargetStatus::Warning
    } else {
        TargetStatus::Online
    }
}

/// Result type alias for sink and directory operations
pub type SinkResult<T> = Result<T, SinkError>;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("unknown target `{0}`")]
    UnknownTarget(Identity),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Resolves credentials to targets. Owned by the registration system; the
/// hub never creates targets.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn lookup_by_token(&self, token: &str) -> SinkResult<Option<Target>>;

    /// Record the name a target declared on connect.
    async fn rename(&self, identity: &Identity, name: &str) -> SinkResult<()>;
}

/// Receives everything decoded from agent sessions.
#[async_trait]
pub trait IngestionSink: Send + Sync {
    async fn record_metric(
        &self,
        identity: &Identity,
        sample: &MetricSample,
        at: DateTime<Utc>,
    ) -> SinkResult<()>;

    async fn record_alert(&self, identity: &Identity, alert: &AlertEvent) -> SinkResult<()>;

    async fn set_status(&self, identity: &Identity, status: TargetStatus) -> SinkResult<()>;

    async fn mark_seen(&self, identity: &Identity, at: DateTime<Utc>) -> SinkResult<()>;
}
