//! Entry point for the `numeral-gateway` HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use numeral_executor::ProcessBackend;
use numeral_gateway::{config::GatewayConfig, pipeline::AppState, routes::create_router};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often idle rate-limit windows are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match GatewayConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let state = match AppState::from_config(&config, Arc::new(ProcessBackend::new())) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialise pipeline");
            std::process::exit(1);
        }
    };

    match state.invoker.health_check().await {
        Ok(()) => info!(script = %state.invoker.script_path().display(), "inference worker ready"),
        Err(e) => {
            tracing::warn!(error = %e, "inference worker not ready; /predict fails until it is");
        }
    }

    let limiter = Arc::clone(&state.limiter);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = limiter.sweep(Instant::now()) {
                tracing::warn!(error = %e, "rate-limit sweep failed");
            }
        }
    });

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    info!(addr = %config.listen_addr, posture = ?config.posture, "numeral-gateway listening");

    if let Err(e) = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("numeral-gateway stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
