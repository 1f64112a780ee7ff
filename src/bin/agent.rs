use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use warden::{
    agent::{ClientConfig, MetricProducer, SysinfoProbe, TransportClient},
    config::{locate_agent_config, read_agent_config, write_sample_agent_config},
};

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Reports host metrics to a warden hub")]
struct Args {
    /// Config file (default: ./config.json, /etc/warden/config.json, ~/.warden/config.json)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Write a sample config file and exit
    #[arg(long)]
    init: bool,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("warden", LevelFilter::DEBUG),
        ("warden_agent", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(true),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    if args.init {
        let path = args.file.unwrap_or_else(|| PathBuf::from("config.json"));
        write_sample_agent_config(&path)?;
        info!("sample config written to {}", path.display());
        return Ok(());
    }

    let path = locate_agent_config(args.file.as_deref())?;
    let config = read_agent_config(&path)?.finalize()?;
    info!("using config {}", path.display());

    let client = TransportClient::new(ClientConfig::from_agent_config(&config));
    client
        .connect()
        .await
        .context("failed to connect to hub")?;

    let cancel = CancellationToken::new();
    let supervisor = tokio::spawn(client.clone().run(cancel.clone()));

    let producer = MetricProducer::new(Box::new(SysinfoProbe::new()), config.alert_thresholds);
    let collector = tokio::spawn(producer.run(
        Arc::new(client.clone()),
        Duration::from_secs(config.collection_interval),
        cancel.clone(),
    ));

    info!(
        "agent started, reporting as {} every {}s",
        client.config().server_name,
        config.collection_interval
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down agent");
    cancel.cancel();

    for (name, task) in [("collector", collector), ("supervisor", supervisor)] {
        if let Err(e) = task.await {
            error!("{name} task failed: {e}");
        }
    }

    Ok(())
}
