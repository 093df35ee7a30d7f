//! Gateway service entry point.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use gateway::{Gateway, GatewayConfig, GatewayError, StaticWorkerFactory};
use metrics_exporter_prometheus::PrometheusBuilder;
use pubsub::{memory::MemoryBroker, BrokerRegistry};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path =
        std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.toml".to_string());
    let cfg = match GatewayConfig::load(Some(Path::new(&config_path))) {
        Ok(cfg) => cfg,
        Err(GatewayError::Disabled) => {
            info!("gateway section absent, nothing to serve");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let http_port: u16 = std::env::var("HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9090".to_string())
        .parse()?;

    info!("starting gateway");
    info!("  path: {}", cfg.path);
    info!("  broker: {}", cfg.broker);
    info!("  allowed_origins: {:?}", cfg.allowed_origins);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!("prometheus exporter listening on port {}", metrics_port);

    let mut brokers = BrokerRegistry::new();
    brokers.register("memory", Arc::new(MemoryBroker::new()));

    let gateway = Gateway::new(cfg, &brokers, Arc::new(StaticWorkerFactory)).await?;
    let mut fatal = gateway.serve();

    let app = gateway.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("gateway listening on {}", addr);

    // stopping the gateway cancels the executors, which closes the
    // upgraded connections and lets the graceful shutdown finish
    let shutdown_gateway = gateway.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutting down");
        shutdown_gateway.stop().await;
    })
    .into_future();

    tokio::select! {
        result = server => result?,
        Some(e) = fatal.recv() => {
            error!(error = %e, "fatal gateway error");
            gateway.stop().await;
        }
    }

    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
