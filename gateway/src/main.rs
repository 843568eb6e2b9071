use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelgate::{routes, Config, Gateway, HttpBackend, SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| config.logging.level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting modelgate");

    // Initialize components
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(&config.database.url)?);
    let backend = Arc::new(HttpBackend::new(
        config.models.clone(),
        config.lifecycle.shutdown_timeout(),
    ));
    for (name, model) in config.enabled_models() {
        tracing::info!(
            model = %name,
            base_url = %model.base_url,
            max_concurrent = model.max_concurrent(&config.queue),
            supervised = model.command.is_some(),
            "Registered backend"
        );
    }

    let gateway = Arc::new(Gateway::new(config.clone(), store, backend));

    // Rebuild queues and backends from the durable store
    let report = gateway.recover().await?;
    tracing::info!(
        admitted = report.admitted,
        waiting = report.waiting,
        timed_out = report.timed_out,
        "Recovered state from store"
    );

    let tasks = gateway.spawn_background();

    let app = routes::app(gateway.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in tasks {
        task.abort();
    }
    gateway.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
