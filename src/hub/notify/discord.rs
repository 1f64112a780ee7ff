use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

use crate::config::Discord;
use crate::{AlertEvent, Severity};

use crate::hub::ingest::Target;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

fn severity_color(level: Severity) -> u32 {
    match level {
        Severity::Critical | Severity::Error => 15158332, // Red
        Severity::Warning => 15844367,                    // Gold
        Severity::Info => 3447003,                        // Blue
    }
}

fn severity_emoji(level: Severity) -> &'static str {
    match level {
        Severity::Critical | Severity::Error => "🔴",
        Severity::Warning => "⚠️",
        Severity::Info => "ℹ️",
    }
}

fn progress_bar(value: f64, threshold: f64) -> String {
    if threshold <= 0.0 {
        return format!("`{value:.1}`");
    }
    let ratio = value / threshold;
    let filled = ((ratio * 10.0) as usize).min(10);
    let bar = "█".repeat(filled) + &"░".repeat(10 - filled);
    format!("`{bar}` {:.1}% of threshold", ratio * 100.0)
}

pub fn build_alert_embed(target: &Target, alert: &AlertEvent) -> Embed {
    Embed {
        title: Some(format!(
            "{} {} alert",
            severity_emoji(alert.level),
            alert.kind.to_uppercase()
        )),
        description: Some(format!("Server **{}**: {}", target.name, alert.message)),
        color: Some(severity_color(alert.level)),
        fields: vec![
            EmbedField {
                name: "Current".to_string(),
                value: format!("{:.1}", alert.value),
                inline: true,
            },
            EmbedField {
                name: "Threshold".to_string(),
                value: format!("{:.1}", alert.threshold),
                inline: true,
            },
            EmbedField {
                name: "Level".to_string(),
                value: alert.level.to_string(),
                inline: true,
            },
            EmbedField {
                name: "📊 Status".to_string(),
                value: progress_bar(alert.value, alert.threshold),
                inline: false,
            },
        ],
        footer: Some(EmbedFooter {
            text: format!("Server: {} | {}", target.name, target.identity),
        }),
        timestamp: Some(alert.timestamp.to_rfc3339()),
    }
}

pub fn build_message(discord: &Discord, target: &Target, alert: &AlertEvent) -> Message {
    let mut builder = MessageBuilder::new().add_embed(build_alert_embed(target, alert));
    if let Some(user_id) = &discord.user_id {
        builder = builder.content(format!(
            "{} ({} ~ {:.1}) <@{user_id}>",
            severity_emoji(alert.level),
            target.name,
            alert.value
        ));
    }
    builder.build()
}

pub async fn send_alert(
    client: &Client,
    discord: &Discord,
    target: &Target,
    alert: &AlertEvent,
) -> anyhow::Result<()> {
    let message = build_message(discord, target, alert);
    let response = client.post(&discord.url).json(&message).send().await?;

    if response.status().is_success() {
        info!("Successfully sent Discord message at {}", Utc::now().to_rfc3339());
        return Ok(());
    }

    let status = response.status();
    if let Ok(error_text) = response.text().await {
        error!("Discord API error response: {}", error_text);
    }
    anyhow::bail!("Discord message failed with status: {status}")
}
