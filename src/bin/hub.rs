use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use warden::{
    config::read_hub_config,
    hub::{
        HubState, ListenConfig, Reaper, SessionConfig, ingest::MemoryStore, notify,
        spawn_hub_server,
    },
};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Accepts agent connections and ingests their metrics")]
struct Args {
    /// Config file
    #[arg(short, long)]
    file: PathBuf,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("warden", LevelFilter::DEBUG),
        ("warden_hub", LevelFilter::TRACE),
        ("tower_http", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_hub_config(&args.file)?;
    info!("{} target(s) configured", config.targets.len());

    let store = Arc::new(MemoryStore::from_targets(&config.targets));
    let session = SessionConfig::from(&config.session);
    let state = HubState::new(
        store.clone(),
        store,
        notify::from_config(config.alert.as_ref()),
        config.status_thresholds,
        session,
    );

    let cancel = CancellationToken::new();
    let reaper = Reaper::spawn(state.registry.clone(), session.reap_interval, cancel.clone());
    let registry = state.registry.clone();

    let listen = ListenConfig {
        bind_addr: config.bind,
        auth_token: config.api_token.clone(),
    };
    spawn_hub_server(listen, state).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down hub");

    cancel.cancel();
    if let Err(e) = registry.shutdown().await {
        error!("{e}");
    }
    if let Err(e) = reaper.await {
        error!("reaper task failed: {e}");
    }

    Ok(())
}
