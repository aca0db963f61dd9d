use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;

use ara_notification_pipeline::config::Settings;
use ara_notification_pipeline::runtime::Runtime;
use ara_notification_pipeline::server::create_app;
use ara_notification_pipeline::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new().context("failed to load configuration")?;

    // Initialize tracing; the guard flushes spans on exit
    let _telemetry = init_telemetry(&settings.logging, &settings.otel)?;
    tracing::info!("Configuration loaded");

    let addr = settings.server_addr();
    let mut runtime = Runtime::build(settings)
        .await
        .context("pipeline startup failed")?;
    runtime.start().await;

    // Create Axum app
    let app = create_app(runtime.state().clone());

    // Start server
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    // The HTTP server stops first; the pipeline drains afterwards
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let result = runtime.shutdown("signal").await;
    if !result.success {
        tracing::warn!(?result, "Shutdown finished with pending work");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
