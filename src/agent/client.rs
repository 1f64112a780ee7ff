//! Resilient WebSocket link from an agent to the hub.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//!                                               │  loss (inbound error, idle deadline,
//!                                               │  failed write or heartbeat)
//!                                               ▼
//!                          Connected ◀──ok── Reconnecting ◀─┐
//!                                               │ failed    │
//!                                               └── sleep(attempt × base, max) ─┘
//! ```
//!
//! Every successful connect starts a fresh session with its own
//! [`CancellationToken`] and two tasks: the inbound reader and the heartbeat.
//! Whoever first observes a loss moves the state `Connected → Reconnecting`
//! with a compare-and-swap, cancels the session and wakes the single
//! supervisor ([`TransportClient::run`]). Detectors that lose the race, or
//! that belong to an already cancelled session, do nothing.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{CloseFrame, frame::coding::CloseCode},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::config::AgentConfig;
use crate::protocol::{Envelope, Payload, ProtocolError};
use crate::{AlertEvent, MetricSample};

use super::backoff::Backoff;
use super::producer::Publisher;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid hub endpoint `{endpoint}`: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },

    #[error("handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("hub rejected the connection with status {0}")]
    Rejected(u16),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("not connected to the hub")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: String,
    pub token: String,
    pub server_name: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub read_idle_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff: Backoff,
}

impl ClientConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        let link = &config.link;
        Self {
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
            server_name: config.server_name(),
            handshake_timeout: Duration::from_secs(link.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(link.heartbeat_interval_secs),
            read_idle_timeout: Duration::from_secs(link.read_idle_timeout_secs),
            write_timeout: Duration::from_secs(link.write_timeout_secs),
            backoff: Backoff::new(
                Duration::from_secs(link.reconnect_interval_secs),
                Duration::from_secs(link.max_reconnect_delay_secs),
            ),
        }
    }

    /// Endpoint with the credential and declared name as query parameters.
    pub fn connect_url(&self) -> Result<Url, ClientError> {
        let mut url =
            Url::parse(&self.endpoint).map_err(|source| ClientError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("server_name", &self.server_name);
        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Reconnecting,
            _ => LinkState::Disconnected,
        }
    }
}

struct Inner {
    config: ClientConfig,
    state: AtomicU8,
    attempts: AtomicU32,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    session: Mutex<Option<CancellationToken>>,
    lost: Notify,
}

impl Inner {
    fn store_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn current_session(&self) -> Option<CancellationToken> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace_session(&self, next: Option<CancellationToken>) -> Option<CancellationToken> {
        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *session, next)
    }
}

/// Cheaply cloneable handle to one logical hub connection.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: AtomicU8::new(LinkState::Disconnected as u8),
                attempts: AtomicU32::new(0),
                sink: tokio::sync::Mutex::new(None),
                session: Mutex::new(None),
                lost: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// Reconnect attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Initial connect. A failure here is left to the caller.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.inner.store_state(LinkState::Connecting);
        let result = self.establish().await;
        if result.is_err() {
            self.inner.store_state(LinkState::Disconnected);
        }
        result
    }

    async fn establish(&self) -> Result<(), ClientError> {
        let config = &self.inner.config;
        let url = config.connect_url()?;
        debug!("connecting to {}", config.endpoint);

        let (stream, _response) =
            match time::timeout(config.handshake_timeout, connect_async(url.as_str())).await {
                Err(_) => return Err(ClientError::HandshakeTimeout(config.handshake_timeout)),
                Ok(Err(tungstenite::Error::Http(response))) => {
                    return Err(ClientError::Rejected(response.status().as_u16()));
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(connected)) => connected,
            };

        let (sink, source) = stream.split();
        *self.inner.sink.lock().await = Some(sink);

        let session = CancellationToken::new();
        if let Some(previous) = self.inner.replace_session(Some(session.clone())) {
            previous.cancel();
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        self.inner.store_state(LinkState::Connected);

        tokio::spawn(self.clone().inbound_loop(source, session.clone()));
        tokio::spawn(self.clone().heartbeat_loop(session));

        info!("connected to hub at {}", config.endpoint);
        Ok(())
    }

    fn mark_lost(&self, session: &CancellationToken, reason: &str) {
        if session.is_cancelled() {
            return;
        }
        let swapped = self.inner.state.compare_exchange(
            LinkState::Connected as u8,
            LinkState::Reconnecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_err() {
            trace!("loss already reported: {reason}");
            return;
        }
        warn!("connection to hub lost: {reason}");
        session.cancel();
        self.inner.lost.notify_one();
    }

    /// Report loss of the current session from outside the client's own loops.
    pub fn report_lost(&self, reason: &str) {
        if let Some(session) = self.inner.current_session() {
            self.mark_lost(&session, reason);
        }
    }

    /// Supervise the link until `cancel` fires: wait for a loss, then retry
    /// with linear backoff until connected again. Never gives up.
    #[instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.inner.lost.notified() => {}
            }

            self.inner.sink.lock().await.take();

            if !self.reconnect(&cancel).await {
                break;
            }
        }

        self.close().await;
        debug!("link supervisor stopped");
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> bool {
        loop {
            let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let delay = self.inner.config.backoff.delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "reconnecting to hub");

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return false,
                result = self.establish() => result,
            };

            match result {
                Ok(()) => {
                    info!(attempt, "reconnected to hub");
                    return true;
                }
                Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
            }
        }
    }

    async fn inbound_loop(self, mut source: WsSource, session: CancellationToken) {
        let idle = self.inner.config.read_idle_timeout;

        loop {
            let next = tokio::select! {
                _ = session.cancelled() => break,
                next = time::timeout(idle, source.next()) => next,
            };

            match next {
                Err(_) => {
                    self.mark_lost(&session, "no frames from hub within the read deadline");
                    break;
                }
                Ok(None) => {
                    self.mark_lost(&session, "hub closed the stream");
                    break;
                }
                Ok(Some(Err(e))) => {
                    self.mark_lost(&session, &e.to_string());
                    break;
                }
                Ok(Some(Ok(Message::Text(text)))) => self.handle_inbound(&text),
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!("close frame from hub: {frame:?}");
                    self.mark_lost(&session, "hub closed the connection");
                    break;
                }
                Ok(Some(Ok(_))) => {}
            }
        }

        trace!("inbound loop finished");
    }

    fn handle_inbound(&self, text: &str) {
        match Envelope::decode(text) {
            Ok(envelope) => match envelope.payload {
                Payload::ConfigUpdate(update) => info!("received config update: {update}"),
                Payload::Command(command) => info!("received command: {command}"),
                other => debug!("unexpected `{}` message from hub", other.kind()),
            },
            Err(e) => warn!("dropping message from hub: {e}"),
        }
    }

    async fn heartbeat_loop(self, session: CancellationToken) {
        let period = self.inner.config.heartbeat_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write(Message::Ping(Vec::new())).await {
                        debug!("heartbeat failed: {e}");
                        break;
                    }
                }
            }
        }

        trace!("heartbeat loop finished");
    }

    /// Write one frame. A failed or timed-out write counts as connection loss.
    async fn write(&self, message: Message) -> Result<(), ClientError> {
        let deadline = self.inner.config.write_timeout;
        let result = {
            let mut guard = self.inner.sink.lock().await;
            let sink = guard.as_mut().ok_or(ClientError::NotConnected)?;
            match time::timeout(deadline, sink.send(message)).await {
                Err(_) => Err(ClientError::WriteTimeout(deadline)),
                Ok(Err(e)) => Err(ClientError::from(e)),
                Ok(Ok(())) => Ok(()),
            }
        };

        if let Err(e) = &result {
            self.report_lost(&e.to_string());
        }
        result
    }

    async fn send_payload(&self, payload: Payload) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let config = &self.inner.config;
        let text = Envelope::new(&config.token, &config.server_name, payload).encode()?;
        self.write(Message::Text(text)).await
    }

    pub async fn send_metrics(&self, sample: &MetricSample) -> Result<(), ClientError> {
        self.send_payload(Payload::Metrics(sample.clone())).await
    }

    pub async fn send_alert(&self, alert: &AlertEvent) -> Result<(), ClientError> {
        self.send_payload(Payload::Alert(alert.clone())).await
    }

    /// Send a normal Close frame and stop both session loops.
    pub async fn close(&self) {
        self.inner.store_state(LinkState::Disconnected);
        if let Some(session) = self.inner.replace_session(None) {
            session.cancel();
        }

        let sink = self.inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "agent shutting down".into(),
            };
            match time::timeout(
                self.inner.config.write_timeout,
                sink.send(Message::Close(Some(frame))),
            )
            .await
            {
                Ok(Ok(())) => debug!("sent close frame to hub"),
                Ok(Err(e)) => debug!("failed to send close frame: {e}"),
                Err(_) => debug!("timed out sending close frame"),
            }
        }
    }
}

#[async_trait]
impl Publisher for TransportClient {
    fn is_connected(&self) -> bool {
        TransportClient::is_connected(self)
    }

    async fn send_metrics(&self, sample: &MetricSample) -> Result<(), ClientError> {
        TransportClient::send_metrics(self, sample).await
    }

    async fn send_alert(&self, alert: &AlertEvent) -> Result<(), ClientError> {
        TransportClient::send_alert(self, alert).await
    }
}
