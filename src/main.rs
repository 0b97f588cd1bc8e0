use anyhow::{Context, Result};
use cacheeasy_exporter::collectors::{MachineCollector, PrometheusAdapter};
use cacheeasy_exporter::config::{load_config, DEFAULT_CONFIG_FILE};
use cacheeasy_exporter::reconcile::Reconciler;
use cacheeasy_exporter::scheduler::{ConfigFileSource, RefreshScheduler, REFRESH_INTERVAL};
use cacheeasy_exporter::server::{self, ServerState};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cacheeasy-exporter")]
#[command(about = "Prometheus exporter for Redis servers and Predixy proxies with live target reloading")]
#[command(version)]
struct Cli {
    /// Configuration file listing the targets to monitor
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Listen address, overrides `bind` from the configuration file
    #[arg(short, long)]
    bind: Option<String>,
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
    /// Enable debug output
    #[arg(long)]
    debug: bool,
}

fn init_tracing(cli: &Cli) {
    let level = if cli.debug {
        LevelFilter::DEBUG
    } else if cli.verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };

    // RUST_LOG takes precedence over the flags when set
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("Starting exporter with config: {}", cli.config.display());

    let config = load_config(&cli.config)?;
    let bind = config.resolve_bind(cli.bind.as_deref());

    let registry = prometheus::Registry::new();
    let machine = MachineCollector::new().context("failed to create machine collector")?;
    registry
        .register(Box::new(machine))
        .context("failed to register machine collector")?;

    let engine = Arc::new(Reconciler::new(PrometheusAdapter::new(registry.clone())));
    let (targets, skipped) = config.targets();
    engine
        .reconcile(&targets)
        .context("initial target setup failed")?;
    info!(
        "{} targets active ({} malformed entries skipped)",
        engine.len(),
        skipped.len()
    );

    let listener = server::bind(&bind).await?;
    let scheduler = RefreshScheduler::spawn(
        Arc::clone(&engine),
        ConfigFileSource::new(&cli.config),
        REFRESH_INTERVAL,
    );

    let state = ServerState { registry, engine };
    let served = server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    })
    .await;

    scheduler.stop().await;
    served
}
