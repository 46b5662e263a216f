//! Fulfillment service entry point.

use std::sync::Arc;

use domain::{InMemoryOrderLedger, PostgresOrderLedger};
use event_channel::{InMemoryEventChannel, PostgresEventChannel};
use fulfillment_service::{Backends, Config, LogFormat, StatusBoard, Workers};
use sqlx::postgres::PgPoolOptions;
use stock::{InMemoryInventoryTable, PostgresInventoryTable};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env().expect("invalid configuration");
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Storage and background workers
    let status = Arc::new(StatusBoard::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = match config.database_url.as_deref() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to database");
            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL backends");

            Workers::start(
                Backends {
                    orders: PostgresOrderLedger::new(pool.clone()),
                    inventory: PostgresInventoryTable::new(pool.clone()),
                    channel: PostgresEventChannel::new(pool, config.channel_partitions),
                },
                &config,
                Arc::clone(&status),
                shutdown_rx,
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory backends");
            Workers::start(
                Backends {
                    orders: InMemoryOrderLedger::new(),
                    inventory: InMemoryInventoryTable::new(),
                    channel: InMemoryEventChannel::with_partitions(config.channel_partitions),
                },
                &config,
                Arc::clone(&status),
                shutdown_rx,
            )
        }
    };

    // 4. Operational endpoints
    let app = fulfillment_service::create_app(status, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting fulfillment service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 5. Stop background work
    let _ = shutdown_tx.send(true);
    workers.join().await;

    tracing::info!("service shut down gracefully");
}
