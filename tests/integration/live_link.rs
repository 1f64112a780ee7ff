//! Live link tests: a real hub on a loopback port, raw agent sockets
//!
//! These tests verify that:
//! - Credentials are checked before the upgrade
//! - Metrics and alerts reach the sink and the notifier
//! - A target has at most one live connection
//! - Transport loss and idleness mark the target offline
//! - Pushes reach the agent, both directly and over REST

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio_tungstenite::{connect_async, tungstenite};
use warden::hub::{Identity, SessionConfig, TargetStatus};
use warden::protocol::{Envelope, Payload};

use crate::helpers::*;

#[tokio::test]
async fn test_unknown_token_is_rejected_before_upgrade() {
    let hub = spawn_default_hub().await;

    let result = connect_async(hub.ws_url("bogus", "x")).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        Err(e) => panic!("expected 401, got {e}"),
        Ok(_) => panic!("expected 401, got an upgrade"),
    }

    assert!(hub.state.registry.connected().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_token_is_bad_request() {
    let hub = spawn_default_hub().await;

    let result = connect_async(format!("ws://{}/agent/connect", hub.addr)).await;
    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 400),
        Err(e) => panic!("expected 400, got {e}"),
        Ok(_) => panic!("expected 400, got an upgrade"),
    }
}

#[tokio::test]
async fn test_connect_marks_online() {
    let hub = spawn_default_hub().await;

    let _socket = hub.connect("t-web").await;

    wait_for_connected(&hub.state, "web-1", true).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Online).await;
}

#[tokio::test]
async fn test_declared_name_is_recorded() {
    let hub = spawn_default_hub().await;

    let (_socket, _) = connect_async(hub.ws_url("t-db", "primary-db")).await.unwrap();

    assert_eq!(
        hub.store.name(&Identity::new("db-1")).await.as_deref(),
        Some("primary-db")
    );
}

#[tokio::test]
async fn test_metrics_reach_sink_and_drive_status() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;

    send(&mut socket, metrics_frame("t-web", 92.5)).await;

    wait_for_metrics(&hub.store, "web-1", 1).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Warning).await;

    let stored = hub.store.metrics(&Identity::new("web-1")).await;
    assert_eq!(stored[0].sample, test_sample(92.5));
    assert!(hub.store.last_seen(&Identity::new("web-1")).await.is_some());

    send(&mut socket, metrics_frame("t-web", 12.0)).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Online).await;
}

#[tokio::test]
async fn test_alert_is_recorded_and_notified() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;

    send(&mut socket, alert_frame("t-web")).await;

    let notified = tokio::time::timeout(Duration::from_secs(5), async {
        while hub.notifier.count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(notified.is_ok(), "owner was never notified");

    let alerts = hub.store.alerts(&Identity::new("web-1")).await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert.kind, "cpu");

    let sent = hub.notifier.sent.lock().unwrap();
    assert_eq!(sent[0].0.identity, Identity::new("web-1"));
}

#[tokio::test]
async fn test_bad_frames_are_dropped_without_closing() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;

    send(&mut socket, tungstenite::Message::Text(String::from("not json"))).await;
    send(
        &mut socket,
        tungstenite::Message::Text(json!({ "type": "telemetry", "data": {} }).to_string()),
    )
    .await;
    send(&mut socket, metrics_frame("t-web", 10.0)).await;

    wait_for_metrics(&hub.store, "web-1", 1).await;
    assert!(
        hub.state
            .registry
            .is_connected(&Identity::new("web-1"))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_mismatched_token_is_dropped() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;

    send(&mut socket, metrics_frame("t-db", 10.0)).await;
    send(&mut socket, metrics_frame("t-web", 20.0)).await;

    wait_for_metrics(&hub.store, "web-1", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stored = hub.store.metrics(&Identity::new("web-1")).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].sample.cpu.usage, 20.0);
    assert!(hub.store.metrics(&Identity::new("db-1")).await.is_empty());
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let hub = spawn_default_hub().await;

    let mut first = hub.connect("t-web").await;
    wait_for_connected(&hub.state, "web-1", true).await;
    let before = hub.state.registry.connected().await.unwrap();

    let mut second = hub.connect("t-web").await;
    wait_closed(&mut first).await;

    let after = hub.state.registry.connected().await.unwrap();
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].connection, before[0].connection);
    assert_eq!(
        hub.store.status(&Identity::new("web-1")).await,
        Some(TargetStatus::Online)
    );

    // the surviving connection still works
    send(&mut second, metrics_frame("t-web", 10.0)).await;
    wait_for_metrics(&hub.store, "web-1", 1).await;
}

#[tokio::test]
async fn test_closing_transport_marks_offline() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Online).await;

    socket.close(None).await.unwrap();

    wait_for_connected(&hub.state, "web-1", false).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Offline).await;
}

#[tokio::test]
async fn test_silent_agent_hits_read_deadline() {
    let hub = spawn_hub(SessionConfig {
        read_deadline: Duration::from_millis(300),
        ..SessionConfig::default()
    })
    .await;
    let mut socket = hub.connect("t-web").await;

    wait_closed(&mut socket).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Offline).await;
}

#[tokio::test]
async fn test_hub_pings_agents() {
    let hub = spawn_hub(SessionConfig {
        ping_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    })
    .await;
    let mut socket = hub.connect("t-web").await;

    let pinged = tokio::time::timeout(Duration::from_secs(5), async {
        use futures::StreamExt;
        while let Some(Ok(message)) = socket.next().await {
            if message.is_ping() {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(pinged.ok(), Some(true));
}

#[tokio::test]
async fn test_push_reaches_agent() {
    let hub = spawn_default_hub().await;
    let mut socket = hub.connect("t-web").await;
    wait_for_connected(&hub.state, "web-1", true).await;

    hub.state
        .registry
        .push(
            &Identity::new("web-1"),
            Payload::ConfigUpdate(json!({ "collection_interval": 10 })),
        )
        .await
        .unwrap();

    let text = next_text(&mut socket).await.expect("no frame pushed");
    let envelope = Envelope::decode(&text).unwrap();
    assert_eq!(
        envelope.payload,
        Payload::ConfigUpdate(json!({ "collection_interval": 10 }))
    );
}

#[tokio::test]
async fn test_rest_push_and_disconnect() {
    let hub = spawn_default_hub().await;
    let client = reqwest::Client::new();
    let mut socket = hub.connect("t-web").await;
    wait_for_connected(&hub.state, "web-1", true).await;

    let response = client
        .post(hub.api("/api/v1/agents/web-1/push"))
        .json(&json!({ "type": "command", "data": { "op": "restart" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .post(hub.api("/api/v1/agents/web-1/push"))
        .bearer_auth(API_TOKEN)
        .json(&json!({ "type": "command", "data": { "op": "restart" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let text = next_text(&mut socket).await.expect("no frame pushed");
    assert_eq!(
        Envelope::decode(&text).unwrap().payload,
        Payload::Command(json!({ "op": "restart" }))
    );

    let response = client
        .get(hub.api("/api/v1/agents"))
        .bearer_auth(API_TOKEN)
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["agents"][0]["id"], "web-1");

    let response = client
        .delete(hub.api("/api/v1/agents/web-1"))
        .bearer_auth(API_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    wait_closed(&mut socket).await;
    wait_for_status(&hub.store, "web-1", TargetStatus::Offline).await;

    let response = client
        .post(hub.api("/api/v1/agents/web-1/push"))
        .bearer_auth(API_TOKEN)
        .json(&json!({ "type": "command" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rest_rejects_unknown_push_type() {
    let hub = spawn_default_hub().await;
    let client = reqwest::Client::new();

    let response = client
        .post(hub.api("/api/v1/agents/web-1/push"))
        .bearer_auth(API_TOKEN)
        .json(&json!({ "type": "reboot" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(hub.api("/api/v1/agents/web-1/push"))
        .bearer_auth(API_TOKEN)
        .json(&json!({ "type": "metrics", "data": test_sample(1.0) }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .get(hub.api("/api/v1/agents"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client.get(hub.api("/api/v1/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
