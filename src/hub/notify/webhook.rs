use reqwest::Client;
use serde_json::{Value, json};
use tracing::info;

use crate::AlertEvent;
use crate::config::Webhook;

use crate::hub::ingest::Target;

pub fn payload(target: &Target, alert: &AlertEvent) -> Value {
    json!({
        "message": format!("[{}] {}: {}", alert.level, target.name, alert.message),
        "server": target.name,
        "server_id": target.identity,
        "type": alert.kind,
        "level": alert.level,
        "value": alert.value,
        "threshold": alert.threshold,
        "timestamp": alert.timestamp.to_rfc3339(),
    })
}

pub async fn send_alert(
    client: &Client,
    webhook: &Webhook,
    target: &Target,
    alert: &AlertEvent,
) -> anyhow::Result<()> {
    let response = client
        .post(&webhook.url)
        .json(&payload(target, alert))
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("Webhook alert failed with status: {}", response.status());
    }

    info!("Successfully sent webhook alert");
    Ok(())
}
