//! Collector side of the live link
//!
//! ## Architecture
//!
//! - **Axum** serves the agent upgrade endpoint and a small REST surface
//! - **RegistryActor** owns every live connection (see [`registry`])
//! - **Session tasks** read and write one agent socket each (see [`session`])
//! - **Reaper** evicts connections that went quiet (see [`reaper`])
//!
//! ## Endpoints
//!
//! - `GET /agent/connect?token=..&server_name=..` - Agent WebSocket upgrade
//! - `GET /api/v1/health` - Health check
//! - `GET /api/v1/agents` - Connected agents
//! - `GET /api/v1/agents/{id}` - Connection state of one agent
//! - `POST /api/v1/agents/{id}/push` - Queue a message for an agent
//! - `DELETE /api/v1/agents/{id}` - Close an agent's connection

pub mod connection;
pub mod error;
pub mod ingest;
pub mod messages;
pub mod middleware;
pub mod notify;
pub mod reaper;
pub mod registry;
pub mod routes;
pub mod session;

pub use connection::{AgentConnection, ConnectionId, PushError};
pub use error::{HubError, HubResult};
pub use ingest::{Identity, IngestionSink, Target, TargetDirectory, TargetStatus};
pub use notify::Notifier;
pub use reaper::Reaper;
pub use registry::RegistryHandle;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{SessionSettings, StatusThresholds};

/// Session timing and sizing, resolved from [`SessionSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub write_deadline: Duration,
    pub outbound_capacity: usize,
    pub reap_interval: Duration,
    pub stale_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            read_deadline: Duration::from_secs(settings.read_deadline_secs),
            ping_interval: Duration::from_secs(settings.ping_interval_secs),
            write_deadline: Duration::from_secs(settings.write_deadline_secs),
            outbound_capacity: settings.outbound_capacity,
            reap_interval: Duration::from_secs(settings.reap_interval_secs),
            stale_after: Duration::from_secs(settings.stale_after_secs),
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct HubState {
    pub registry: RegistryHandle,
    pub directory: Arc<dyn TargetDirectory>,
    pub sink: Arc<dyn IngestionSink>,
    pub notifier: Arc<dyn Notifier>,
    pub thresholds: StatusThresholds,
    pub session: SessionConfig,
}

impl HubState {
    /// Build the state and spawn the registry actor.
    pub fn new(
        directory: Arc<dyn TargetDirectory>,
        sink: Arc<dyn IngestionSink>,
        notifier: Arc<dyn Notifier>,
        thresholds: StatusThresholds,
        session: SessionConfig,
    ) -> Self {
        let registry = RegistryHandle::spawn(sink.clone(), session.stale_after);
        Self {
            registry,
            directory,
            sink,
            notifier,
            thresholds,
            session,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub bind_addr: SocketAddr,

    /// Optional bearer token for the REST surface. The agent endpoint is
    /// always guarded by the agent's own credential instead.
    pub auth_token: Option<String>,
}

pub fn router(config: &ListenConfig, state: HubState) -> Router {
    let mut api = Router::new()
        .route("/api/v1/agents", get(routes::list_agents))
        .route(
            "/api/v1/agents/:id",
            get(routes::agent_status).delete(routes::disconnect_agent),
        )
        .route("/api/v1/agents/:id/push", post(routes::push_to_agent));

    if let Some(token) = config.auth_token.as_deref() {
        api = api.route_layer(axum::middleware::from_fn_with_state(
            Arc::<str>::from(token),
            middleware::require_api_token,
        ));
    }

    Router::new()
        .route("/agent/connect", get(session::agent_connect))
        .route("/api/v1/health", get(routes::health_check))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve the hub in a background task. Returns the bound address.
pub async fn spawn_hub_server(config: ListenConfig, state: HubState) -> anyhow::Result<SocketAddr> {
    info!("starting hub on {}", config.bind_addr);

    let app = router(&config, state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("hub listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("hub server error: {}", e);
        }
    });

    Ok(addr)
}
