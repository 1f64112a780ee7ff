//! Transport client against a real hub
//!
//! These tests verify that:
//! - The client streams metrics and alerts once connected
//! - A rejected credential surfaces as a handshake error
//! - The supervisor reconnects after the hub drops the link
//! - Heartbeats keep an otherwise idle link alive
//! - A silent hub is detected through the read deadline

use std::time::Duration;

use assert_matches::assert_matches;
use tokio_util::sync::CancellationToken;
use warden::agent::{Backoff, ClientConfig, ClientError, LinkState, TransportClient};
use warden::hub::{Identity, SessionConfig, TargetStatus};

use crate::helpers::*;

fn client_config(hub: &TestHub, token: &str) -> ClientConfig {
    ClientConfig {
        endpoint: hub.endpoint(),
        token: token.to_string(),
        server_name: String::from("web"),
        handshake_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(30),
        read_idle_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_secs(2),
        backoff: Backoff::new(Duration::from_millis(50), Duration::from_millis(200)),
    }
}

async fn wait_for_state(client: &TransportClient, state: LinkState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while client.state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "client never reached {state:?}");
}

#[tokio::test]
async fn test_client_streams_metrics_and_alerts() {
    let hub = spawn_default_hub().await;
    let client = TransportClient::new(client_config(&hub, "t-web"));

    client.connect().await.unwrap();
    assert_eq!(client.state(), LinkState::Connected);

    client.send_metrics(&test_sample(42.0)).await.unwrap();
    client.send_alert(&test_alert()).await.unwrap();

    wait_for_metrics(&hub.store, "web-1", 1).await;
    let alerts = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let alerts = hub.store.alerts(&Identity::new("web-1")).await;
            if !alerts.is_empty() {
                return alerts;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(alerts[0].alert.value, 92.5);

    client.close().await;
}

#[tokio::test]
async fn test_client_rejected_with_unknown_token() {
    let hub = spawn_default_hub().await;
    let client = TransportClient::new(client_config(&hub, "nope"));

    assert_matches!(client.connect().await, Err(ClientError::Rejected(401)));
    assert_eq!(client.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_client_reconnects_after_hub_disconnect() {
    let hub = spawn_default_hub().await;
    let client = TransportClient::new(client_config(&hub, "t-web"));
    client.connect().await.unwrap();

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(client.clone().run(cancel.clone()));

    wait_for_connected(&hub.state, "web-1", true).await;
    let before = hub.state.registry.connected().await.unwrap()[0].connection;

    assert!(
        hub.state
            .registry
            .disconnect(&Identity::new("web-1"))
            .await
            .unwrap()
    );

    // the client notices the close, backs off and comes back on a new connection
    let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let connected = hub.state.registry.connected().await.unwrap();
            if let Some(info) = connected.first()
                && info.connection != before
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reconnected.is_ok(), "client never reconnected");

    wait_for_state(&client, LinkState::Connected).await;
    assert_eq!(client.attempts(), 0);

    client.send_metrics(&test_sample(10.0)).await.unwrap();
    wait_for_metrics(&hub.store, "web-1", 1).await;

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), supervisor)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(client.state(), LinkState::Disconnected);
    wait_for_status(&hub.store, "web-1", TargetStatus::Offline).await;
}

#[tokio::test]
async fn test_heartbeat_keeps_idle_link_alive() {
    let hub = spawn_hub(SessionConfig {
        read_deadline: Duration::from_millis(400),
        ..SessionConfig::default()
    })
    .await;
    let mut config = client_config(&hub, "t-web");
    config.heartbeat_interval = Duration::from_millis(100);
    let client = TransportClient::new(config);
    client.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert!(client.is_connected());
    assert!(
        hub.state
            .registry
            .is_connected(&Identity::new("web-1"))
            .await
            .unwrap()
    );

    client.close().await;
}

#[tokio::test]
async fn test_silent_hub_is_detected() {
    let hub = spawn_default_hub().await;
    let mut config = client_config(&hub, "t-web");
    config.read_idle_timeout = Duration::from_millis(200);
    let client = TransportClient::new(config);
    client.connect().await.unwrap();

    // no supervisor running, so the loss parks the client in Reconnecting
    wait_for_state(&client, LinkState::Reconnecting).await;
    assert_matches!(
        client.send_metrics(&test_sample(1.0)).await,
        Err(ClientError::NotConnected)
    );
}

#[tokio::test]
async fn test_close_marks_target_offline() {
    let hub = spawn_default_hub().await;
    let client = TransportClient::new(client_config(&hub, "t-web"));
    client.connect().await.unwrap();
    wait_for_status(&hub.store, "web-1", TargetStatus::Online).await;

    client.close().await;

    assert_eq!(client.state(), LinkState::Disconnected);
    wait_for_status(&hub.store, "web-1", TargetStatus::Offline).await;
}
