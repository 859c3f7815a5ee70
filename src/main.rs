//! Alert relay server.
//!
//! Accepts device alerts over HTTP, scores them, and fans them out as
//! notification tasks through a priority queue to a channel dispatcher.
//!
//! # API Endpoints
//!
//! - `POST /alerts` - Process an alert
//! - `GET /queue/stats` - Queue occupancy and counters
//! - `POST /queue/cleanup` - Evict expired dedup entries
//! - `GET /health` - Health check

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use alert_relay::analyzer::AlertAnalyzer;
use alert_relay::api::{AppState, router};
use alert_relay::config::RelayConfig;
use alert_relay::dispatch::{ChannelDispatcher, DispatchWorker, HttpDispatcher, LogDispatcher};
use alert_relay::distribution::Distributor;
use alert_relay::pipeline::AlertPipeline;
use alert_relay::priority::{NoGeoRisk, PriorityCalculator};
use alert_relay::queue::PriorityDeduplicatingQueue;
use alert_relay::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("alert_relay=info".parse()?))
        .init();

    let config = RelayConfig::from_env();

    info!(
        port = config.port,
        db_url = %config.database_url,
        shutdown_policy = ?config.worker.shutdown_policy,
        "Starting alert relay"
    );

    let storage = Arc::new(Storage::new(&config.database_url).await?);
    info!("Database initialized");

    let queue = Arc::new(PriorityDeduplicatingQueue::new(config.queue.clone()));
    let wake = Arc::new(Notify::new());

    let dispatcher: Arc<dyn ChannelDispatcher> = match &config.dispatch_url {
        Some(url) => Arc::new(HttpDispatcher::new(url)),
        None => Arc::new(LogDispatcher),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = DispatchWorker::new(
        Arc::clone(&queue),
        dispatcher,
        Arc::clone(&wake),
        config.worker.clone(),
    )
    .with_tracker(storage.clone())
    .spawn(shutdown_rx);

    let distributor = Distributor::new(Arc::clone(&queue), storage.clone(), wake);
    let pipeline = AlertPipeline::new(
        AlertAnalyzer::neutral(config.analyzer.clone()),
        PriorityCalculator::new(Arc::new(NoGeoRisk), config.priority.clone()),
        distributor,
        storage,
        config.analyzer.collaborator_timeout,
    );

    let app = router(AppState::new(pipeline))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Alert relay is listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
        })
        .await?;

    shutdown_tx.send(true)?;
    let report = worker.await?;
    info!(
        batches = report.batches,
        dispatched = report.dispatched_tasks,
        retried = report.retried_tasks,
        failed = report.failed_tasks,
        "Alert relay stopped"
    );

    Ok(())
}
