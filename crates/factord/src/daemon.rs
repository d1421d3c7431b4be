//! Subsystem assembly and lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use factor_core::FactorConfig;
use factorgrid_api::{build_router, ApiState};
use factorgrid_autoscale::{Autoscaler, FleetManager, ScalePolicy};
use factorgrid_fleet::{InstanceProvider, StaticProvider};
use factorgrid_health::HealthMonitor;
use factorgrid_scheduler::{Dispatcher, FleetController, HttpJobSender};
use factorgrid_telemetry::{ChannelSource, TelemetryFeed};

use crate::control;

/// Events the telemetry endpoint may queue between feed polls.
const TELEMETRY_QUEUE: usize = 4096;

pub async fn run(config: FactorConfig) -> anyhow::Result<()> {
    info!("FactorGrid daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let provider: Arc<dyn InstanceProvider> =
        Arc::new(StaticProvider::new(config.provider.addresses.clone()));
    info!(hosts = config.provider.addresses.len(), "static instance provider initialized");

    let fleet = Arc::new(FleetManager::from_config(provider.clone(), &config));

    let sender = Arc::new(HttpJobSender::new(
        config.worker.port,
        config.server.public_ip.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(fleet.clone(), sender, &config.dispatch));
    info!(
        threshold = config.dispatch.complexity_threshold,
        public_ip = %config.server.public_ip,
        "dispatcher initialized"
    );

    let health = HealthMonitor::new(dispatcher.clone(), provider, config.health.interval());

    let (telemetry_sink, telemetry_source) = ChannelSource::channel(TELEMETRY_QUEUE);
    let feed = TelemetryFeed::new(dispatcher.clone(), config.telemetry.interval())
        .with_source(Arc::new(telemetry_source));

    let mut autoscaler = Autoscaler::new(
        dispatcher.clone(),
        fleet.clone(),
        ScalePolicy::from(&config.autoscale),
    );

    // Bring the fleet up to its minimum before taking traffic.
    for _ in 0..config.autoscale.min_workers {
        autoscaler.tick().await;
    }
    info!(workers = dispatcher.workers().await.len(), "initial fleet ready");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let health_shutdown = shutdown_rx.clone();
    let health_handle = tokio::spawn(async move {
        health.run(health_shutdown).await;
    });

    let feed_shutdown = shutdown_rx.clone();
    let feed_handle = tokio::spawn(async move {
        feed.run(feed_shutdown).await;
    });

    let autoscale_interval = config.autoscale.interval();
    let autoscale_shutdown = shutdown_rx;
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_interval, autoscale_shutdown).await;
    });

    // ── Start HTTP server ──────────────────────────────────────

    let router = build_router(ApiState {
        dispatcher: dispatcher.clone(),
        telemetry: telemetry_sink,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "HTTP server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let stop_dispatcher = dispatcher.clone();
    let stop_fleet = fleet.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        control::shutdown_signal().await;
        info!("shutting down");
        let _ = shutdown_tx.send(true);

        // Releases every waiting caller so open connections can finish.
        let workers = stop_dispatcher.shutdown().await;
        for worker in &workers {
            stop_fleet.terminate_instance(worker).await;
        }
    });

    server.await?;

    // Wait for background tasks.
    for (name, handle) in [
        ("health monitor", health_handle),
        ("telemetry feed", feed_handle),
        ("autoscaler", autoscale_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "background task ended abnormally");
        }
    }

    // Anything started after the dispatcher emptied its fleet.
    fleet.terminate_all().await;

    info!("FactorGrid daemon stopped");
    Ok(())
}
