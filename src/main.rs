//! PingIT - Network reachability monitor.
//!
//! Probes configured targets over ICMP, tracks per-target health and
//! disconnect events, persists history to SQLite and serves a drain-on-read
//! Prometheus metrics endpoint.

mod config;
mod db;
mod metrics;
mod probe;
mod registry;
mod scheduler;
mod stats;
mod web;

use config::ServerConfig;
use db::Store;
use metrics::MetricsCollector;
use scheduler::Scheduler;
use web::Server;

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pingit=info".parse()?),
        )
        .init();

    let cfg = ServerConfig::load();
    tracing::info!("starting PingIT on port {}...", cfg.http_port);

    // Fatal on any invalid target: the rest of the system only ever sees a
    // validated, immutable registry.
    let app = config::load(&cfg.config_path)?;
    if app.registry.is_empty() {
        tracing::warn!("no targets configured in {}", cfg.config_path);
    }
    tracing::info!(
        "loaded {} targets, reporting every {} cycles",
        app.registry.len(),
        app.report_cycles
    );

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("database initialized at {}", cfg.db_path);

    let metrics = Arc::new(MetricsCollector::new(&app.registry));

    // Probers and the web server stop on `shutdown`; the writer has its own
    // stop signal so it drains everything the probe loops enqueued first.
    let (shutdown_tx, _) = broadcast::channel(1);
    let (writer_stop_tx, writer_stop_rx) = broadcast::channel(1);

    let (writer_handle, writer_task) = db::writer::spawn(
        store.clone(),
        db::writer::DEFAULT_QUEUE_CAPACITY,
        writer_stop_rx,
    );

    let scheduler = Scheduler::new(
        app.registry.clone(),
        app.report_cycles,
        app.on_overrun,
        writer_handle.clone(),
        metrics.clone(),
    );
    let probe_tasks = scheduler.start(&shutdown_tx);

    let server = Server::new(cfg, app.registry.clone(), metrics, writer_handle);
    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.start(server_shutdown).await {
            tracing::error!("web server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping probe loops");
    let _ = shutdown_tx.send(());

    for task in probe_tasks {
        let _ = task.await;
    }

    let _ = writer_stop_tx.send(());
    let _ = writer_task.await;
    let _ = server_task.await;

    tracing::info!("PingIT stopped");
    Ok(())
}
