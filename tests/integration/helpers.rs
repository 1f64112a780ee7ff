//! Test helpers shared by the live link tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use warden::{
    AlertEvent, CpuInfo, DiskInfo, MemoryInfo, MetricSample, NetworkInfo, Severity,
    config::{StatusThresholds, TargetConfig},
    hub::{
        HubState, Identity, ListenConfig, Notifier, SessionConfig, Target, TargetStatus,
        ingest::MemoryStore, spawn_hub_server,
    },
    protocol::{Envelope, Payload},
};

pub const API_TOKEN: &str = "api-secret";

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Notifier that remembers what it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(Target, AlertEvent)>>,
}

impl RecordingNotifier {
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_owners(&self, target: &Target, alert: &AlertEvent) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), alert.clone()));
        Ok(())
    }
}

pub struct TestHub {
    pub addr: SocketAddr,
    pub store: Arc<MemoryStore>,
    pub state: HubState,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHub {
    pub fn ws_url(&self, token: &str, server_name: &str) -> String {
        format!(
            "ws://{}/agent/connect?token={token}&server_name={server_name}",
            self.addr
        )
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/agent/connect", self.addr)
    }

    pub fn api(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Open a raw agent socket with a valid credential
    pub async fn connect(&self, token: &str) -> Socket {
        let (socket, _) = connect_async(self.ws_url(token, "")).await.unwrap();
        socket
    }
}

/// Two targets: `web-1` (token `t-web`) and `db-1` (token `t-db`)
pub fn test_targets() -> Vec<TargetConfig> {
    vec![
        TargetConfig {
            id: String::from("web-1"),
            token: String::from("t-web"),
            name: Some(String::from("web")),
        },
        TargetConfig {
            id: String::from("db-1"),
            token: String::from("t-db"),
            name: None,
        },
    ]
}

pub async fn spawn_hub(session: SessionConfig) -> TestHub {
    let store = Arc::new(MemoryStore::from_targets(&test_targets()));
    let notifier = Arc::new(RecordingNotifier::default());
    let state = HubState::new(
        store.clone(),
        store.clone(),
        notifier.clone(),
        StatusThresholds::default(),
        session,
    );

    let listen = ListenConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_token: Some(API_TOKEN.to_string()),
    };
    let addr = spawn_hub_server(listen, state.clone()).await.unwrap();

    TestHub {
        addr,
        store,
        state,
        notifier,
    }
}

pub async fn spawn_default_hub() -> TestHub {
    spawn_hub(SessionConfig::default()).await
}

pub fn test_sample(cpu: f64) -> MetricSample {
    MetricSample {
        cpu: CpuInfo {
            usage: cpu,
            cores: 4,
        },
        memory: MemoryInfo {
            total: 8_000_000_000,
            used: 2_000_000_000,
            available: 6_000_000_000,
            used_percent: 25.0,
        },
        disk: DiskInfo {
            total: 100_000_000_000,
            used: 40_000_000_000,
            free: 60_000_000_000,
            used_percent: 40.0,
        },
        network: NetworkInfo {
            bytes_sent: 1_000,
            bytes_recv: 2_000,
            packets_sent: 10,
            packets_recv: 20,
        },
        uptime: 120,
    }
}

pub fn test_alert() -> AlertEvent {
    AlertEvent {
        kind: String::from("cpu"),
        level: Severity::Warning,
        message: String::from("CPU usage is 92.5% (threshold: 80.0%)"),
        value: 92.5,
        threshold: 80.0,
        timestamp: Utc::now(),
    }
}

pub fn metrics_frame(token: &str, cpu: f64) -> Message {
    let envelope = Envelope::new(token, "web", Payload::Metrics(test_sample(cpu)));
    Message::Text(envelope.encode().unwrap())
}

pub fn alert_frame(token: &str) -> Message {
    let envelope = Envelope::new(token, "web", Payload::Alert(test_alert()));
    Message::Text(envelope.encode().unwrap())
}

pub async fn send(socket: &mut Socket, message: Message) {
    socket.send(message).await.unwrap();
}

/// Read until the next text frame, skipping control frames
pub async fn next_text(socket: &mut Socket) -> Option<String> {
    let read = async {
        while let Some(Ok(message)) = socket.next().await {
            match message {
                Message::Text(text) => return Some(text),
                Message::Close(_) => return None,
                _ => continue,
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .unwrap_or(None)
}

/// Wait until the socket is closed by the hub
pub async fn wait_closed(socket: &mut Socket) {
    let closed = async {
        loop {
            match socket.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .expect("socket was not closed by the hub");
}

pub async fn wait_for_status(store: &MemoryStore, id: &str, status: TargetStatus) {
    let identity = Identity::new(id);
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.status(&identity).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{id} never became {status:?}");
}

pub async fn wait_for_metrics(store: &MemoryStore, id: &str, count: usize) {
    let identity = Identity::new(id);
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if store.metrics(&identity).await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{id} never recorded {count} sample(s)");
}

pub async fn wait_for_connected(state: &HubState, id: &str, connected: bool) {
    let identity = Identity::new(id);
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if state.registry.is_connected(&identity).await.unwrap() == connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{id} connected state never became {connected}");
}
