use anyhow::{Context, Result};
use detector_service::api::start_api_server;
use detector_service::{init_state, Config, PlaceholderDetector};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        mode = ?config.processing.mode,
        "Starting Detector Service"
    );

    // Initialize metrics
    if config.service.metrics_enabled {
        init_metrics(config.service.metrics_port)?;
    }

    let shutdown = CancellationToken::new();

    // Initialize components
    let (state, worker) = init_state(&config, Arc::new(PlaceholderDetector), shutdown.clone())
        .await
        .context("Failed to initialize service")?;

    // Spawn detection worker task
    let worker_handle = worker.map(|worker| {
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!(error = %e, "Detection worker error");
            }
        })
    });

    // Spawn API server task
    let api_config = config.api.clone();
    let upload_config = config.uploads.clone();
    let api_shutdown = shutdown.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config, &upload_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Detector service started successfully");

    // Wait for shutdown signal, or the server exiting on its own
    let api_finished = tokio::select! {
        _ = shutdown_signal() => false,
        _ = &mut api_handle => {
            error!("API server exited unexpectedly");
            true
        }
    };

    info!("Shutting down detector service");

    shutdown.cancel();

    if !api_finished {
        if let Err(e) = api_handle.await {
            error!(error = %e, "API server task failed");
        }
    }
    if let Some(handle) = worker_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Detection worker task failed");
        }
    }

    info!("Detector service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
