//! Local metric sampling and threshold evaluation.
//!
//! ```text
//! tick → sample host (cpu, memory, disk, network, uptime)
//!      → evaluate thresholds → publish sample → publish alerts
//! ```
//!
//! A cycle that fails to read any one metric family is discarded as a
//! whole; the next tick starts from scratch.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sysinfo::{Disks, Networks, System};
use thiserror::Error;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AlertThresholds;
use crate::{AlertEvent, CpuInfo, DiskInfo, MemoryInfo, MetricSample, NetworkInfo, Severity};

use super::client::ClientError;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("failed to read cpu usage: {0}")]
    Cpu(String),
    #[error("failed to read memory usage: {0}")]
    Memory(String),
    #[error("failed to read disk usage: {0}")]
    Disk(String),
    #[error("failed to read network counters: {0}")]
    Network(String),
}

/// Source of raw host readings.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// CPU usage needs two readings some time apart, hence async.
    async fn cpu(&self) -> Result<CpuInfo, CollectError>;
    fn memory(&self) -> Result<MemoryInfo, CollectError>;
    fn disk(&self) -> Result<DiskInfo, CollectError>;
    fn network(&self) -> Result<NetworkInfo, CollectError>;
}

/// [`HostProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut system)
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[async_trait]
impl HostProbe for SysinfoProbe {
    async fn cpu(&self) -> Result<CpuInfo, CollectError> {
        self.with_system(|system| system.refresh_cpu_usage());
        time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;

        self.with_system(|system| {
            system.refresh_cpu_usage();
            let cores = system.cpus().len();
            if cores == 0 {
                return Err(CollectError::Cpu(String::from("no cpus reported")));
            }
            Ok(CpuInfo {
                usage: f64::from(system.global_cpu_usage()),
                cores: cores as u32,
            })
        })
    }

    fn memory(&self) -> Result<MemoryInfo, CollectError> {
        self.with_system(|system| {
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                return Err(CollectError::Memory(String::from(
                    "total memory reported as zero",
                )));
            }
            let used = system.used_memory();
            Ok(MemoryInfo {
                total,
                used,
                available: system.available_memory(),
                used_percent: percent(used, total),
            })
        })
    }

    fn disk(&self) -> Result<DiskInfo, CollectError> {
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .or_else(|| disks.list().first())
            .ok_or_else(|| CollectError::Disk(String::from("no mounted filesystem found")))?;

        let total = disk.total_space();
        let free = disk.available_space();
        let used = total.saturating_sub(free);
        Ok(DiskInfo {
            total,
            used,
            free,
            used_percent: percent(used, total),
        })
    }

    fn network(&self) -> Result<NetworkInfo, CollectError> {
        let networks = Networks::new_with_refreshed_list();
        let info = networks.list().values().fold(
            NetworkInfo {
                bytes_sent: 0,
                bytes_recv: 0,
                packets_sent: 0,
                packets_recv: 0,
            },
            |acc, data| NetworkInfo {
                bytes_sent: acc.bytes_sent + data.total_transmitted(),
                bytes_recv: acc.bytes_recv + data.total_received(),
                packets_sent: acc.packets_sent + data.total_packets_transmitted(),
                packets_recv: acc.packets_recv + data.total_packets_received(),
            },
        );
        Ok(info)
    }
}

/// Sink for produced records, implemented by the transport client.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn send_metrics(&self, sample: &MetricSample) -> Result<(), ClientError>;
    async fn send_alert(&self, alert: &AlertEvent) -> Result<(), ClientError>;
}

/// Evaluate a sample against local thresholds.
///
/// A value strictly above its threshold yields one `warning` alert. There is
/// no hysteresis, so a host stuck above a threshold alerts on every sample.
pub fn check_alerts(
    sample: &MetricSample,
    thresholds: &AlertThresholds,
    at: DateTime<Utc>,
) -> Vec<AlertEvent> {
    let checks = [
        ("cpu", "CPU", sample.cpu.usage, thresholds.cpu),
        ("memory", "Memory", sample.memory.used_percent, thresholds.memory),
        ("disk", "Disk", sample.disk.used_percent, thresholds.disk),
    ];

    checks
        .into_iter()
        .filter(|(_, _, value, threshold)| value > threshold)
        .map(|(kind, label, value, threshold)| AlertEvent {
            kind: kind.to_string(),
            level: Severity::Warning,
            message: format!("{label} usage is {value:.1}% (threshold: {threshold:.1}%)"),
            value,
            threshold,
            timestamp: at,
        })
        .collect()
}

/// Result of one collection cycle.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub sample: MetricSample,
    pub alerts: Vec<AlertEvent>,
    /// Whether the hub link was up when the cycle finished.
    pub published: bool,
}

pub struct MetricProducer {
    probe: Box<dyn HostProbe>,
    thresholds: AlertThresholds,
    started: Instant,
}

impl MetricProducer {
    pub fn new(probe: Box<dyn HostProbe>, thresholds: AlertThresholds) -> Self {
        Self {
            probe,
            thresholds,
            started: Instant::now(),
        }
    }

    pub async fn collect(&self) -> Result<MetricSample, CollectError> {
        let cpu = self.probe.cpu().await?;
        let memory = self.probe.memory()?;
        let disk = self.probe.disk()?;
        let network = self.probe.network()?;

        Ok(MetricSample {
            cpu,
            memory,
            disk,
            network,
            uptime: self.started.elapsed().as_secs() as i64,
        })
    }

    /// Sample once, evaluate thresholds and hand everything to `publisher`.
    ///
    /// Records produced while the link is down are dropped.
    pub async fn collect_once(&self, publisher: &dyn Publisher) -> Result<Cycle, CollectError> {
        let sample = self.collect().await?;

        info!(
            "CPU: {:.1}% | Memory: {:.1}% | Disk: {:.1}%",
            sample.cpu.usage, sample.memory.used_percent, sample.disk.used_percent
        );

        let alerts = check_alerts(&sample, &self.thresholds, Utc::now());
        for alert in &alerts {
            warn!("ALERT: {}", alert.message);
        }

        if !publisher.is_connected() {
            debug!("hub link down, dropping sample and {} alert(s)", alerts.len());
            return Ok(Cycle {
                sample,
                alerts,
                published: false,
            });
        }

        if let Err(e) = publisher.send_metrics(&sample).await {
            error!("failed to send metrics: {e}");
        }
        for alert in &alerts {
            if let Err(e) = publisher.send_alert(alert).await {
                error!("failed to send alert: {e}");
            }
        }

        Ok(Cycle {
            sample,
            alerts,
            published: true,
        })
    }

    /// Run collection cycles every `period` until `cancel` fires.
    #[instrument(skip_all, fields(period_secs = period.as_secs()))]
    pub async fn run(
        self,
        publisher: Arc<dyn Publisher>,
        period: Duration,
        cancel: CancellationToken,
    ) {
        debug!("starting metric producer");

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_once(publisher.as_ref()).await {
                        error!("collection cycle aborted: {e}");
                    }
                }
            }
        }

        debug!("metric producer stopped");
    }
}
