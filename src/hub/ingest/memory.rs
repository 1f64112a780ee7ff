//! In-memory target directory and ingestion sink.
//!
//! Metrics and alerts are kept in bounded ring buffers, so the store never
//! grows past a fixed size regardless of how long the hub runs.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;

use crate::config::TargetConfig;
use crate::{AlertEvent, MetricSample};

use super::{
    Identity, IngestionSink, SinkError, SinkResult, Target, TargetDirectory, TargetStatus,
};

/// Maximum samples kept per buffer (ring buffer)
const MAX_BUFFER_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct StoredMetric {
    pub identity: Identity,
    pub sample: MetricSample,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredAlert {
    pub identity: Identity,
    pub alert: AlertEvent,
}

#[derive(Debug, Default)]
struct TargetRecord {
    name: String,
    token: String,
    status: TargetStatus,
    last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    targets: HashMap<Identity, TargetRecord>,
    by_token: HashMap<String, Identity>,
    metrics: VecDeque<StoredMetric>,
    alerts: VecDeque<StoredAlert>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(targets: &[TargetConfig]) -> Self {
        let mut state = State::default();
        for target in targets {
            let identity = Identity::new(&target.id);
            state
                .by_token
                .insert(target.token.clone(), identity.clone());
            state.targets.insert(
                identity,
                TargetRecord {
                    name: target.name.clone().unwrap_or_else(|| target.id.clone()),
                    token: target.token.clone(),
                    ..Default::default()
                },
            );
        }
        Self {
            state: RwLock::new(state),
        }
    }

    /// Register a target, replacing any previous one with the same id.
    pub async fn add_target(&self, id: &str, token: &str, name: &str) {
        let mut state = self.state.write().await;
        let identity = Identity::new(id);
        if let Some(previous) = state.targets.get(&identity) {
            let stale = previous.token.clone();
            state.by_token.remove(&stale);
        }
        state.by_token.insert(token.to_string(), identity.clone());
        state.targets.insert(
            identity,
            TargetRecord {
                name: name.to_string(),
                token: token.to_string(),
                ..Default::default()
            },
        );
    }

    pub async fn status(&self, identity: &Identity) -> Option<TargetStatus> {
        let state = self.state.read().await;
        state.targets.get(identity).map(|record| record.status)
    }

    pub async fn name(&self, identity: &Identity) -> Option<String> {
        let state = self.state.read().await;
        state.targets.get(identity).map(|record| record.name.clone())
    }

    pub async fn last_seen(&self, identity: &Identity) -> Option<DateTime<Utc>> {
        let state = self.state.read().await;
        state.targets.get(identity).and_then(|record| record.last_seen)
    }

    pub async fn metrics(&self, identity: &Identity) -> Vec<StoredMetric> {
        let state = self.state.read().await;
        state
            .metrics
            .iter()
            .filter(|stored| &stored.identity == identity)
            .cloned()
            .collect()
    }

    pub async fn alerts(&self, identity: &Identity) -> Vec<StoredAlert> {
        let state = self.state.read().await;
        state
            .alerts
            .iter()
            .filter(|stored| &stored.identity == identity)
            .cloned()
            .collect()
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T) {
    if buffer.len() >= MAX_BUFFER_SIZE {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

#[async_trait]
impl TargetDirectory for MemoryStore {
    async fn lookup_by_token(&self, token: &str) -> SinkResult<Option<Target>> {
        let state = self.state.read().await;
        let target = state.by_token.get(token).and_then(|identity| {
            state.targets.get(identity).map(|record| Target {
                identity: identity.clone(),
                name: record.name.clone(),
            })
        });
        Ok(target)
    }

    async fn rename(&self, identity: &Identity, name: &str) -> SinkResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .targets
            .get_mut(identity)
            .ok_or_else(|| SinkError::UnknownTarget(identity.clone()))?;
        trace!("renaming {identity}: {} -> {name}", record.name);
        record.name = name.to_string();
        Ok(())
    }
}

#[async_trait]
impl IngestionSink for MemoryStore {
    async fn record_metric(
        &self,
        identity: &Identity,
        sample: &MetricSample,
        at: DateTime<Utc>,
    ) -> SinkResult<()> {
        let mut state = self.state.write().await;
        push_bounded(
            &mut state.metrics,
            StoredMetric {
                identity: identity.clone(),
                sample: sample.clone(),
                at,
            },
        );
        Ok(())
    }

    async fn record_alert(&self, identity: &Identity, alert: &AlertEvent) -> SinkResult<()> {
        let mut state = self.state.write().await;
        push_bounded(
            &mut state.alerts,
            StoredAlert {
                identity: identity.clone(),
                alert: alert.clone(),
            },
        );
        Ok(())
    }

    async fn set_status(&self, identity: &Identity, status: TargetStatus) -> SinkResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .targets
            .get_mut(identity)
            .ok_or_else(|| SinkError::UnknownTarget(identity.clone()))?;
        record.status = status;
        Ok(())
    }

    async fn mark_seen(&self, identity: &Identity, at: DateTime<Utc>) -> SinkResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .targets
            .get_mut(identity)
            .ok_or_else(|| SinkError::UnknownTarget(identity.clone()))?;
        record.last_seen = Some(at);
        Ok(())
    }
}
