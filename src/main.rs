//! pingcheck - latency and loss monitor for a fleet of ping relays.

mod config;
mod db;
mod monitor;
mod probe;
mod scheduler;
mod web;

use config::{ConfigHandle, MonitorConfig, ServerConfig};
use db::Store;
use monitor::Registry;
use probe::HttpProber;
use scheduler::{Reporter, RetentionManager, RollupManager, Scheduler, StatusReporter};
use web::{AppState, Server};

use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("pingcheck=info".parse()?))
        .init();

    // Load configuration
    config::load_dotenv();
    let cfg = ServerConfig::load()?;
    let monitor_cfg = MonitorConfig::from_env()?;
    tracing::info!("Starting pingcheck on {}:{}...", cfg.host, cfg.http_port);

    let targets = config::load_targets(&cfg.servers_file)?;
    tracing::info!("Loaded {} targets from {}", targets.len(), cfg.servers_file.display());

    let registry = Arc::new(Registry::new(targets, Utc::now()));
    let config = Arc::new(ConfigHandle::new(monitor_cfg));

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Using database at {}", cfg.db_path);

    let (samples_tx, _writer) = scheduler::spawn_batch_writer(store.clone());
    RollupManager::new(store.clone()).start();
    RetentionManager::new(store.clone()).start();

    // Start probing
    let prober = Arc::new(HttpProber::new()?);
    let sched = Arc::new(
        Scheduler::new(registry.clone(), prober, config.subscribe(), cfg.source_ip.clone())
            .with_persistence(samples_tx),
    );
    sched.start(cfg.worker_count);

    // Start reporting
    let mut reporter = Reporter::new(registry.clone(), config.clone(), cfg.report_interval);
    match &cfg.report {
        Some(report) => {
            tracing::info!("Reporting abnormal count to {}", report.url);
            reporter = reporter.with_status_page(StatusReporter::new(report.clone())?);
        }
        None => tracing::info!("Status page reporting disabled"),
    }
    reporter.start();

    // Start web server
    let server = Server::new(&cfg, AppState { registry, config, store });
    server.start().await?;

    Ok(())
}
