//! Relay process bootstrap.
//!
//! This module wires together:
//! - telemetry and configuration
//! - database connection pool and migrations
//! - the resilient broker connection
//! - the delta publisher loop
//!
//! The process runs until SIGINT/SIGTERM, or until the broker connection is
//! lost for good, which is reported as an error so the supervisor restarts
//! the process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infra::broker::{spawn_event_recorder, BrokerClient, ResilientBroker};
use crate::infra::encoder::DeltaEncoder;
use crate::infra::retry::{is_retryable_db_error, Retry, RetryConfig, TokioSleeper};
use crate::infra::{
    join_with_timeout, shutdown_signal, DeltaPublisher, PgDeltaStore, ShutdownCoordinator,
};
use crate::metrics::MetricsRegistry;
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Start the relay and block until it stops.
pub async fn run() -> anyhow::Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry).map_err(|e| anyhow::anyhow!("failed to init telemetry: {e}"))?;

    info!("Starting quote-relay v{}", env!("CARGO_PKG_VERSION"));

    let result = run_with_config(Config::from_env()?).await;
    if let Err(e) = &result {
        error!(error = %e, "quote-relay stopped with an error");
    }

    shutdown_telemetry();
    result
}

/// Run the relay with an explicit configuration.
pub async fn run_with_config(config: Config) -> anyhow::Result<()> {
    let pool = connect_database(&config).await?;
    crate::migrations::run_postgres(&pool)
        .await
        .context("failed to run migrations")?;
    info!("database migrations applied");

    let encoder = match &config.event_schema_path {
        Some(path) => DeltaEncoder::from_schema_file(path, config.program.clone())?,
        None => DeltaEncoder::with_bundled_schema(config.program.clone())?,
    };
    info!(
        schema = %encoder.schema().name,
        version = encoder.schema().version,
        program = %config.program.id,
        "event encoder ready"
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let broker = ResilientBroker::new(broker_client(), config.broker_config());
    let recorder = spawn_event_recorder(broker.events(), metrics.clone());
    let mut fatal = broker.fatal();

    if let Err(e) = broker.connect().await {
        warn!(error = %e, "initial broker connection failed, retrying");
        broker.reconnect().await?;
    }

    let publisher = Arc::new(
        DeltaPublisher::new(
            config.publisher_config(),
            Arc::new(PgDeltaStore::new(pool.clone())),
            Arc::new(encoder),
            broker.clone(),
        )
        .with_metrics(metrics.clone()),
    );

    let coordinator = ShutdownCoordinator::new();
    let runner = {
        let publisher = publisher.clone();
        let signal = coordinator.signal();
        tokio::spawn(async move { publisher.run(signal).await })
    };

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        reason = wait_fatal(&mut fatal) => Err(anyhow::anyhow!(reason)),
    };

    coordinator.shutdown().await;
    join_with_timeout(runner, DRAIN_TIMEOUT).await;

    if let Err(e) = broker.close().await {
        warn!(error = %e, "error closing broker connection");
    }
    recorder.abort();
    pool.close().await;

    let stats = publisher.stats().await;
    info!(
        cycles = stats.cycles,
        published = stats.deltas_published,
        flagged = stats.documents_flagged,
        "quote-relay stopped"
    );
    outcome
}

async fn wait_fatal(fatal: &mut watch::Receiver<Option<String>>) -> String {
    let reason = match fatal.wait_for(Option::is_some).await {
        Ok(reason) => reason.clone(),
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        // Sender gone means the broker was dropped; nothing left to report
        None => std::future::pending().await,
    }
}

async fn connect_database(config: &Config) -> anyhow::Result<PgPool> {
    let sleeper = TokioSleeper;
    let retry = Retry::new(RetryConfig::database(), &sleeper);
    let outcome = retry
        .run(
            || {
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .connect(&config.database_url)
            },
            is_retryable_db_error,
            |attempt| info!(attempt, "connecting to database"),
        )
        .await;

    outcome
        .into_result()
        .context("failed to connect to database")
}

#[cfg(feature = "amqp")]
fn broker_client() -> Arc<dyn BrokerClient> {
    Arc::new(crate::infra::broker::AmqpClient::new())
}

#[cfg(not(feature = "amqp"))]
fn broker_client() -> Arc<dyn BrokerClient> {
    Arc::new(crate::infra::broker::MemoryBroker::new())
}
