//! GPU gateway - admission control and streaming proxy in front of an inference backend.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gpu_gateway::{app, AppState, Config, HttpBackend};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    if env::args().any(|a| a == "--version" || a == "-V") {
        println!("gpu-gateway {}", VERSION);
        return Ok(());
    }

    // Load configuration
    let config = Config::load()
        .map_err(|e| format!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let admission = config.admission();
    tracing::info!(
        backend = %config.backend_base_url,
        model = %config.model_name,
        max_active = admission.max_active,
        queue_mode = ?admission.queue_mode,
        queue_max = admission.queue_max,
        queue_timeout_ms = admission.queue_timeout.as_millis() as u64,
        "Starting gpu-gateway {}",
        VERSION
    );

    let backend = HttpBackend::new(
        &config.backend_base_url,
        config.connect_timeout(),
        config.request_timeout(),
    )?;
    let state = Arc::new(AppState::new(config.clone(), Arc::new(backend))?);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
