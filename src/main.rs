use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

use relayq::config::{Config, Env};
use relayq::forwarder::ForwarderManager;
use relayq::health::HealthServer;
use relayq::metrics::{AtomicMetrics, MetricsSink};
use relayq::source::{QueueIngest, SourceClient};
use relayq::store::sqlite::SqliteStore;
use relayq::store::{QueueStore, RetryPolicy};

/// Cadence of the periodic metrics log line.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(600);

/// Time allowed between the shutdown signal and forced exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RELAYQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let env = Env::load()?;
    let mut config = Config::load(env.config_path())?;
    if let Some(db_path) = env.db_path.clone() {
        config.database.path = db_path;
    }
    tracing::info!(
        targets = config.target_servers.len(),
        "configuration loaded and validated"
    );

    let retry = RetryPolicy::new(
        config.forwarder.base_retry_interval(),
        config.forwarder.max_retry_interval(),
    );
    let sqlite = SqliteStore::connect(&config.database.path, retry).await?;
    tracing::info!(path = %config.database.path, "database ready");

    let store: Arc<dyn QueueStore> = Arc::new(sqlite.clone());
    store.reconcile_targets(&config.target_servers).await?;
    tracing::info!("target servers reconciled");

    let metrics: Arc<dyn MetricsSink> = Arc::new(AtomicMetrics::default());
    let shutdown = CancellationToken::new();

    let health = if config.health.enabled {
        Some(HealthServer::spawn(config.health.port, sqlite.db().clone())?)
    } else {
        None
    };

    let manager = ForwarderManager::new(
        config.forwarder.clone(),
        store.clone(),
        metrics.clone(),
        shutdown.clone(),
    );
    manager.start().await?;

    let ingest = Arc::new(QueueIngest::new(store.clone(), metrics.clone()));
    let client = Arc::new(SourceClient::new(&config, ingest, shutdown.clone())?);
    let client_task = tokio::spawn(client.run());

    let metrics_task = tokio::spawn({
        let metrics = metrics.clone();
        let cancel = shutdown.clone();
        async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + METRICS_LOG_INTERVAL,
                METRICS_LOG_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::info!(metrics = %metrics.snapshot(), "system metrics");
                    }
                }
            }
        }
    });

    tracing::info!("relayq is running");

    shutdown_signal().await;
    tracing::info!("shutdown signal received");

    shutdown.cancel();

    let graceful = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = client_task.await;
        manager.stop().await;
        let _ = metrics_task.await;
    })
    .await;

    if graceful.is_err() {
        tracing::warn!("graceful shutdown window exceeded, exiting anyway");
    }

    if let Some(health) = health {
        health.stop().await;
    }

    tracing::info!(metrics = %metrics.snapshot(), "relayq shut down");

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
