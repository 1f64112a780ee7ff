use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::registry::RegistryHandle;

/// Periodically evicts connections that stopped showing signs of life.
pub struct Reaper;

impl Reaper {
    pub fn spawn(
        registry: RegistryHandle,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::run(registry, period, cancel))
    }

    #[instrument(skip(registry, cancel))]
    async fn run(registry: RegistryHandle, period: Duration, cancel: CancellationToken) {
        debug!("starting stale-connection reaper");

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match registry.sweep(Utc::now()).await {
                        Ok(evicted) if evicted.is_empty() => {}
                        Ok(evicted) => info!("evicted {} stale connection(s)", evicted.len()),
                        Err(e) => {
                            error!("sweep failed, stopping reaper: {e}");
                            break;
                        }
                    }
                }
            }
        }

        debug!("reaper stopped");
    }
}
