//! Owner notification for alerts raised by agents.
//!
//! Notification is best-effort: the session spawns it and moves on, failures
//! are only logged.

pub mod discord;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, instrument};

use crate::AlertEvent;
use crate::config::Alert;

use super::ingest::Target;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_owners(&self, target: &Target, alert: &AlertEvent) -> anyhow::Result<()>;
}

/// Notifier used when no channel is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_owners(&self, target: &Target, alert: &AlertEvent) -> anyhow::Result<()> {
        info!(
            target_id = %target.identity,
            level = %alert.level,
            "[{}] {}",
            target.name,
            alert.message
        );
        Ok(())
    }
}

/// Sends alerts to the configured Discord or webhook channel.
#[derive(Debug, Clone)]
pub struct AlertDispatcher {
    client: Client,
    channel: Alert,
}

impl AlertDispatcher {
    pub fn new(channel: Alert) -> Self {
        Self {
            client: Client::new(),
            channel,
        }
    }
}

#[async_trait]
impl Notifier for AlertDispatcher {
    #[instrument(skip_all, fields(target_id = %target.identity, kind = %alert.kind))]
    async fn notify_owners(&self, target: &Target, alert: &AlertEvent) -> anyhow::Result<()> {
        match &self.channel {
            Alert::Discord(discord) => {
                discord::send_alert(&self.client, discord, target, alert).await
            }
            Alert::Webhook(hook) => webhook::send_alert(&self.client, hook, target, alert).await,
        }
    }
}

pub fn from_config(alert: Option<&Alert>) -> Arc<dyn Notifier> {
    match alert {
        Some(channel) => Arc::new(AlertDispatcher::new(channel.clone())),
        None => Arc::new(LogNotifier),
    }
}
