use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub const APP_NAME: &str = "warden";

const CONFIG_FILE_NAME: &str = "config.json";

/// Local alert thresholds evaluated by the agent, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    #[serde(default = "default_cpu_threshold")]
    pub cpu: f64,
    #[serde(default = "default_memory_threshold")]
    pub memory: f64,
    #[serde(default = "default_disk_threshold")]
    pub disk: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu: default_cpu_threshold(),
            memory: default_memory_threshold(),
            disk: default_disk_threshold(),
        }
    }
}

fn default_cpu_threshold() -> f64 {
    80.0
}

fn default_memory_threshold() -> f64 {
    85.0
}

fn default_disk_threshold() -> f64 {
    90.0
}

/// Timing of the agent's link to the hub, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_read_idle_timeout")]
    pub read_idle_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            read_idle_timeout_secs: default_read_idle_timeout(),
            write_timeout_secs: default_write_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("read_idle_timeout_secs", self.read_idle_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("reconnect_interval_secs", self.reconnect_interval_secs),
            ("max_reconnect_delay_secs", self.max_reconnect_delay_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            anyhow::bail!("link.{name} must be at least one second");
        }
        if self.max_reconnect_delay_secs < self.reconnect_interval_secs {
            anyhow::bail!("link.max_reconnect_delay_secs must not be below link.reconnect_interval_secs");
        }
        Ok(())
    }
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_read_idle_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_max_reconnect_delay() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Credential identifying this host to the hub.
    pub token: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Falls back to the host name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Seconds between two metric samples.
    #[serde(default = "default_collection_interval")]
    pub collection_interval: u64,
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,
    #[serde(default)]
    pub link: LinkConfig,
}

fn default_endpoint() -> String {
    String::from("ws://localhost:8080/agent/connect")
}

fn default_collection_interval() -> u64 {
    5
}

impl AgentConfig {
    pub fn sample() -> Self {
        Self {
            token: String::from("your-server-token-here"),
            endpoint: default_endpoint(),
            server_name: Some(String::from("my-server")),
            collection_interval: default_collection_interval(),
            alert_thresholds: AlertThresholds::default(),
            link: LinkConfig::default(),
        }
    }

    /// Apply environment overrides and check required fields.
    pub fn finalize(mut self) -> anyhow::Result<Self> {
        if let Some(token) = crate::util::env_token() {
            self.token = token;
        }
        if let Some(endpoint) = crate::util::env_endpoint() {
            self.endpoint = endpoint;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.token.trim().is_empty() {
            anyhow::bail!("token is required");
        }
        if self.collection_interval == 0 {
            anyhow::bail!("collection_interval must be at least one second");
        }
        self.link.validate()
    }

    pub fn server_name(&self) -> String {
        self.server_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(crate::util::hostname)
    }
}

pub fn read_agent_config(path: impl AsRef<Path>) -> anyhow::Result<AgentConfig> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid agent configuration in {}", path.display()))
        .inspect(|config| trace!("loaded agent config: {config:?}"))
}

/// Candidate locations for the agent config, in lookup order.
pub fn agent_config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(CONFIG_FILE_NAME),
        Path::new("/etc").join(APP_NAME).join(CONFIG_FILE_NAME),
    ];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(format!(".{APP_NAME}")).join(CONFIG_FILE_NAME));
    }
    candidates
}

/// Resolve the agent config file: an explicit path wins, otherwise the
/// first existing candidate.
pub fn locate_agent_config(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    agent_config_candidates()
        .into_iter()
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| anyhow::anyhow!("no config file found (try --init to create one)"))
}

pub fn write_sample_agent_config(path: impl AsRef<Path>) -> anyhow::Result<()> {
    let path = path.as_ref();
    let content = serde_json::to_string_pretty(&AgentConfig::sample())?;
    std::fs::write(path, content)
        .with_context(|| format!("failed to write sample config to {}", path.display()))
}

/// Hub-side limits used to derive a target's status from a sample.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct StatusThresholds {
    #[serde(default = "default_status_cpu")]
    pub cpu: f64,
    #[serde(default = "default_status_memory")]
    pub memory: f64,
    #[serde(default = "default_status_disk")]
    pub disk: f64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            cpu: default_status_cpu(),
            memory: default_status_memory(),
            disk: default_status_disk(),
        }
    }
}

fn default_status_cpu() -> f64 {
    90.0
}

fn default_status_memory() -> f64 {
    95.0
}

fn default_status_disk() -> f64 {
    95.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_read_deadline")]
    pub read_deadline_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_write_deadline")]
    pub write_deadline_secs: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            read_deadline_secs: default_read_deadline(),
            ping_interval_secs: default_ping_interval(),
            write_deadline_secs: default_write_deadline(),
            outbound_capacity: default_outbound_capacity(),
            reap_interval_secs: default_reap_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("read_deadline_secs", self.read_deadline_secs),
            ("ping_interval_secs", self.ping_interval_secs),
            ("write_deadline_secs", self.write_deadline_secs),
            ("reap_interval_secs", self.reap_interval_secs),
            ("stale_after_secs", self.stale_after_secs),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, secs)| *secs == 0) {
            anyhow::bail!("session.{name} must be at least one second");
        }
        if self.outbound_capacity == 0 {
            anyhow::bail!("session.outbound_capacity must be positive");
        }
        // the reaper is the fallback for sessions the read deadline missed
        if self.stale_after_secs <= self.read_deadline_secs {
            anyhow::bail!("session.stale_after_secs must exceed session.read_deadline_secs");
        }
        Ok(())
    }
}

fn default_read_deadline() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54
}

fn default_write_deadline() -> u64 {
    10
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_reap_interval() -> u64 {
    300
}

fn default_stale_after() -> u64 {
    120
}

/// A monitored target known to the hub.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    pub token: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Alert {
    Discord(Discord),
    Webhook(Webhook),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Webhook {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discord {
    pub url: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Bearer token protecting the REST surface.
    pub api_token: Option<String>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub status_thresholds: StatusThresholds,
    pub alert: Option<Alert>,
    #[serde(default)]
    pub session: SessionSettings,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

impl HubConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut tokens = std::collections::HashSet::new();
        for target in &self.targets {
            if target.token.is_empty() {
                anyhow::bail!("target `{}` has an empty token", target.id);
            }
            if !tokens.insert(target.token.as_str()) {
                anyhow::bail!("target `{}` reuses another target's token", target.id);
            }
        }
        self.session.validate()
    }
}

pub fn read_hub_config(path: impl AsRef<Path>) -> anyhow::Result<HubConfig> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: HubConfig = serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    if let Some(bind) = crate::util::env_hub_bind() {
        config.bind = bind;
    }
    config.validate()?;
    trace!("loaded hub config: {config:?}");
    Ok(config)
}
