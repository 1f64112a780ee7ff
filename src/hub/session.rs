//! Per-connection session: handshake validation, reader and writer.
//!
//! ## Message Flow
//!
//! ```text
//! agent ──frames──▶ read_loop ──decode──▶ dispatch ──▶ IngestionSink / Notifier
//!                      │ touches Liveness
//! agent ◀──frames── write_loop ◀── outbound queue ◀── RegistryHandle::push
//!                      └── ping ticker
//! ```
//!
//! Reader and writer share the connection's [`CancellationToken`]. A read
//! error, a failed write, supersession, eviction and explicit disconnect all
//! cancel it, so every teardown ends the same way: the writer sends a Close
//! frame, the reader deregisters.

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use chrono::Utc;
use futures::{
    SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::protocol::{Envelope, Payload};

use super::connection::{AgentConnection, ConnectionLink};
use super::error::{HubError, HubResult};
use super::ingest::{Target, derive_status};
use super::{HubState, SessionConfig};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
    server_name: Option<String>,
}

/// GET /agent/connect?token=..&server_name=..
///
/// The credential is checked before the upgrade; an unknown token never
/// reaches the registry.
pub async fn agent_connect(
    State(state): State<HubState>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> HubResult<Response> {
    let token = params
        .token
        .filter(|token| !token.is_empty())
        .ok_or(HubError::MissingToken)?;

    let mut target = state
        .directory
        .lookup_by_token(&token)
        .await?
        .ok_or(HubError::InvalidToken)?;

    if let Some(name) = params.server_name.filter(|name| !name.is_empty())
        && name != target.name
    {
        match state.directory.rename(&target.identity, &name).await {
            Ok(()) => target.name = name,
            Err(e) => warn!(target_id = %target.identity, "failed to record declared name: {e}"),
        }
    }

    Ok(ws.on_upgrade(move |socket| run_session(state, target, token, socket)))
}

#[instrument(skip_all, fields(target_id = %target.identity))]
async fn run_session(state: HubState, target: Target, token: String, socket: WebSocket) {
    let config = state.session;
    let (connection, link, outbound_rx) = AgentConnection::new(target.clone(), config.outbound_capacity);

    if let Err(e) = state.registry.register(connection).await {
        error!("failed to register connection: {e}");
        return;
    }
    info!(connection = %link.id, "session started for {}", target.name);

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbound_rx, link.clone(), config));

    read_loop(stream, &state, &target, &token, &link).await;
    link.cancel.cancel();

    match state.registry.deregister(target.identity.clone(), link.id).await {
        Ok(true) => {}
        Ok(false) => debug!(connection = %link.id, "connection was already replaced or evicted"),
        Err(e) => error!("failed to deregister connection: {e}"),
    }

    if let Err(e) = writer.await {
        error!("writer task failed: {e}");
    }
    info!(connection = %link.id, "session ended");
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    state: &HubState,
    target: &Target,
    token: &str,
    link: &ConnectionLink,
) {
    let deadline = state.session.read_deadline;

    loop {
        let next = tokio::select! {
            _ = link.cancel.cancelled() => break,
            next = time::timeout(deadline, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                warn!("no frames within {deadline:?}, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("read error: {e}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        link.liveness.touch();

        match message {
            Message::Text(text) => dispatch(state, target, token, &text).await,
            Message::Close(frame) => {
                debug!("agent closed the connection: {frame:?}");
                break;
            }
            Message::Binary(_) => debug!("ignoring binary frame"),
            Message::Ping(_) | Message::Pong(_) => trace!("liveness frame"),
        }
    }
}

/// Decode one text frame and hand it to the collaborators. Nothing here can
/// fail the session; bad frames are logged and dropped.
pub(crate) async fn dispatch(state: &HubState, target: &Target, token: &str, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("dropping frame: {e}");
            return;
        }
    };

    if !envelope.token.is_empty() && envelope.token != token {
        warn!("dropping `{}` frame with mismatched token", envelope.kind());
        return;
    }

    let identity = &target.identity;
    match envelope.payload {
        Payload::Metrics(sample) => {
            if let Err(e) = state
                .sink
                .record_metric(identity, &sample, envelope.timestamp)
                .await
            {
                error!("failed to record metrics: {e}");
            }
            let status = derive_status(&sample, &state.thresholds);
            if let Err(e) = state.sink.set_status(identity, status).await {
                error!("failed to update status: {e}");
            }
        }
        Payload::Alert(alert) => {
            // an alert that was not stored is not announced either
            if let Err(e) = state.sink.record_alert(identity, &alert).await {
                error!("failed to record alert, skipping notification: {e}");
            } else {
                let notifier = state.notifier.clone();
                let target = target.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify_owners(&target, &alert).await {
                        warn!(target_id = %target.identity, "failed to notify owners: {e}");
                    }
                });
            }
        }
        other => debug!("unexpected `{}` frame from agent", other.kind()),
    }

    if let Err(e) = state.sink.mark_seen(identity, Utc::now()).await {
        error!("failed to record last seen: {e}");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    link: ConnectionLink,
    config: SessionConfig,
) {
    let mut ping = time::interval_at(
        Instant::now() + config.ping_interval,
        config.ping_interval,
    );

    loop {
        let message = tokio::select! {
            _ = link.cancel.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match time::timeout(config.write_deadline, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("write failed: {e}");
                link.cancel.cancel();
                return;
            }
            Err(_) => {
                warn!("write did not complete within {:?}", config.write_deadline);
                link.cancel.cancel();
                return;
            }
        }
    }

    let close = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: "".into(),
    }));
    if let Ok(Err(e)) = time::timeout(config.write_deadline, sink.send(close)).await {
        trace!("failed to send close frame: {e}");
    }
}
