//! Sentinel Pipeline service entrypoint.
//!
//! Wires the Event Buffer (NATS JetStream), Rule Store / Alert Store /
//! Correlation Store (Postgres), and Historical Store (HTTP) into the
//! scheduler's three independent loops: the rule scheduler, the
//! correlation consumer, the historical-store indexer consumer, and the
//! expiry sweeper. Grounded on the teacher's `bin/netbox-projector.rs`
//! startup sequence (tracing init, config load, connect, get-or-create
//! stream/consumer), generalized from one consumer to the pipeline's four
//! long-running loops.
//!
//! Run with: cargo run --bin sentinel-pipeline

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use sentinel_pipeline::alerts::{AlertGenerator, PgAlertStore};
use sentinel_pipeline::buffer::nats::NatsEventBuffer;
use sentinel_pipeline::correlation::{CorrelationEngine, ExpirySweeper, FieldEqualityEvaluator, PgCorrelationStateStore};
use sentinel_pipeline::detection::DetectionEngine;
use sentinel_pipeline::historical::HttpHistoricalStore;
use sentinel_pipeline::rules::PgRuleStore;
use sentinel_pipeline::scheduler::{
    run_consumer_loop, CorrelationConsumer, ExpirySweeperDriver, IndexerConsumer, PgSchedulerLease, RuleScheduler,
};
use sentinel_pipeline::subjects::StreamName;
use sentinel_pipeline::ConfigLoader;

/// Real-time detection and correlation pipeline for a DFIR/SIEM platform.
#[derive(Debug, Parser)]
struct Cli {
    /// Path to a TOML config file; missing is not an error, defaults apply.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Index name the historical-store indexer consumer writes into.
    #[arg(long, default_value = "events")]
    index: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!("starting sentinel-pipeline");

    let config = ConfigLoader::load(Some(cli.config.as_path())).context("loading configuration")?;
    info!(nats_url = %config.nats.url, database_url = %config.database.url, "configuration loaded");

    let buffer = Arc::new(
        NatsEventBuffer::connect(&config)
            .await
            .context("connecting to NATS JetStream")?,
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to Postgres")?;

    let rule_store = Arc::new(PgRuleStore::new(pool.clone()));
    let alert_store = Arc::new(PgAlertStore::new(pool.clone()));
    let correlation_store = Arc::new(PgCorrelationStateStore::new(pool.clone()));
    let lease = Arc::new(PgSchedulerLease::new(pool.clone()));

    let historical_store = Arc::new(
        HttpHistoricalStore::new(&config.historical_store).context("building historical store client")?,
    );

    let detection_engine = Arc::new(DetectionEngine::new(historical_store.clone(), config.detection.emit_on_timeout));
    let alert_generator = Arc::new(AlertGenerator::new(buffer.clone(), alert_store, config.alert.event_ring_capacity));

    let correlation_engine = Arc::new(CorrelationEngine::new(
        correlation_store.clone(),
        Arc::new(FieldEqualityEvaluator),
        chrono::Duration::seconds(config.correlation.lateness_bound_seconds as i64),
        config.state.optimistic_retries,
    ));

    let expiry_sweeper = ExpirySweeperDriver::new(
        Arc::new(ExpirySweeper::new(
            correlation_store,
            chrono::Duration::seconds(config.correlation.window_grace_seconds as i64),
            chrono::Duration::seconds(config.correlation.dedup_retention_seconds as i64),
            chrono::Duration::seconds(config.correlation.lateness_bound_seconds as i64),
        )),
        std::time::Duration::from_secs(30),
    );

    let cancel = CancellationToken::new();

    let scheduler = RuleScheduler::new(
        rule_store.clone(),
        detection_engine,
        alert_generator.clone(),
        lease,
        config.tick_duration(),
        config.scheduler.workers,
    );

    let correlation_consumer: Arc<dyn sentinel_pipeline::scheduler::MessageProcessor> = Arc::new(CorrelationConsumer::new(
        rule_store,
        correlation_engine,
        alert_generator,
        config.correlation.shards,
    ));
    let indexer_consumer: Arc<dyn sentinel_pipeline::scheduler::MessageProcessor> =
        Arc::new(IndexerConsumer::new(historical_store, cli.index));

    let mut tasks = tokio::task::JoinSet::new();

    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            scheduler.run(cancel).await;
        });
    }

    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            expiry_sweeper.run(cancel).await;
        });
    }

    {
        let buffer = buffer.clone();
        let cancel = cancel.clone();
        let batch_size = config.consumer.batch_size;
        let block_ms = config.consumer.block_ms;
        let claim_idle_ms = config.consumer.claim_idle_ms;
        tasks.spawn(async move {
            if let Err(error) = run_consumer_loop(
                buffer,
                StreamName::Events,
                "correlation".to_string(),
                "correlation-worker".to_string(),
                correlation_consumer,
                batch_size,
                block_ms,
                claim_idle_ms,
                3,
                cancel,
            )
            .await
            {
                error!(%error, "correlation consumer loop aborted");
            }
        });
    }

    {
        let cancel = cancel.clone();
        let batch_size = config.consumer.batch_size;
        let block_ms = config.consumer.block_ms;
        let claim_idle_ms = config.consumer.claim_idle_ms;
        tasks.spawn(async move {
            if let Err(error) = run_consumer_loop(
                buffer,
                StreamName::Events,
                "indexer".to_string(),
                "indexer-worker".to_string(),
                indexer_consumer,
                batch_size,
                block_ms,
                claim_idle_ms,
                3,
                cancel,
            )
            .await
            {
                error!(%error, "indexer consumer loop aborted");
            }
        });
    }

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining workers");
    cancel.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(error) = result {
            error!(%error, "worker task panicked");
        }
    }

    info!("sentinel-pipeline stopped");
    Ok(())
}
