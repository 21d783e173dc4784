// Scheduler binary entry point
// Wires the stock pipeline, the local run executor, the partition schedule and
// the discovery sensor, then runs until Ctrl+C.

mod pipeline;

use anyhow::Context;
use common::config::{SeenStoreBackend, SeenStoreConfig, Settings};
use common::executor::LocalRunExecutor;
use common::partition::StaticPartitionSet;
use common::request::RunRequestFactory;
use common::schedule::CronTrigger;
use common::scheduler::{CronScheduler, Trigger};
use common::seen::redis::DEFAULT_SEEN_KEYS_HASH;
use common::seen::{FileSeenKeyStore, InMemorySeenKeyStore, RedisSeenKeyStore, SeenKeyStore};
use common::sensor::{PollingSensor, S3DiscoverySource};
use common::storage::{RedisClient, S3Client};
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!("Starting partitioned trigger scheduler");

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    info!(
        s3_endpoint = %settings.s3.endpoint,
        redis_url = %settings.redis.url(),
        schedule_enabled = settings.schedule.enabled,
        sensor_enabled = settings.sensor.enabled,
        "Configuration loaded"
    );

    // Pipeline resources
    let s3 = S3Client::new(&settings.s3).await.map_err(|e| {
        error!(error = %e, "Failed to initialize S3 client");
        e
    })?;
    let redis = RedisClient::new(&settings.redis).await.map_err(|e| {
        error!(error = %e, "Failed to initialize Redis client");
        e
    })?;

    // Backends may still be starting; steps and sensor polls retry on their own
    if let Err(e) = s3.health_check().await {
        warn!(error = %e, "S3 health check failed at startup");
    }
    if let Err(e) = redis.health_check().await {
        warn!(error = %e, "Redis health check failed at startup");
    }

    let stock_pipeline = pipeline::stock_pipeline(Arc::new(s3), Arc::new(redis.clone()))?;
    let executor = Arc::new(LocalRunExecutor::new(
        stock_pipeline,
        settings.retry.policy(),
        Duration::from_secs(settings.executor.step_timeout_seconds),
    ));
    info!(
        max_retries = settings.retry.max_retries,
        step_timeout_seconds = settings.executor.step_timeout_seconds,
        "Run executor initialized"
    );

    let base_config = settings.base_run_config();
    let mut triggers: Vec<Arc<dyn Trigger>> = Vec::new();

    if settings.schedule.enabled {
        let schedule = &settings.schedule;
        let partitions = StaticPartitionSet::new(
            schedule.partitions.iter().cloned(),
            schedule.extract_step.clone(),
            schedule.key_field.clone(),
            schedule.source_key_template.clone(),
        )?;
        let factory = RunRequestFactory::new(
            base_config.clone(),
            schedule.extract_step.clone(),
            schedule.key_field.clone(),
        )
        .with_partitions(Arc::new(partitions));
        let trigger = CronTrigger::with_timezone_name(&schedule.cron, &schedule.timezone)?;

        triggers.push(Arc::new(CronScheduler::new(
            schedule.name.clone(),
            trigger,
            factory,
            executor.clone(),
        )?));
        info!(schedule = %schedule.name, cron = %schedule.cron, "Cron scheduler created");
    }

    if settings.sensor.enabled {
        let seen_store = build_seen_store(&settings.seen_store, &redis).await?;
        let source = S3DiscoverySource::new(&settings.s3, &settings.sensor.bucket)
            .await?
            .with_max_keys(settings.sensor.max_keys);
        let factory = RunRequestFactory::new(
            base_config.clone(),
            settings.schedule.extract_step.clone(),
            settings.schedule.key_field.clone(),
        );

        triggers.push(Arc::new(PollingSensor::new(
            &settings.sensor,
            Arc::new(source),
            seen_store,
            factory,
            executor.clone(),
        )));
        info!(sensor = %settings.sensor.name, "Polling sensor created");
    }

    if triggers.is_empty() {
        warn!("No triggers enabled, nothing will be launched");
    }

    let handles: Vec<_> = triggers
        .iter()
        .map(|trigger| {
            let trigger = Arc::clone(trigger);
            tokio::spawn(async move { trigger.start().await })
        })
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    // Timers stop first; in-flight ticks finish emitting
    for trigger in &triggers {
        trigger.stop();
    }
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Trigger task failed");
        }
    }

    executor.shutdown().await;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}

/// Open the seen-key store for the configured backend
async fn build_seen_store(
    config: &SeenStoreConfig,
    redis: &RedisClient,
) -> anyhow::Result<Arc<dyn SeenKeyStore>> {
    let store: Arc<dyn SeenKeyStore> = match config.backend {
        SeenStoreBackend::Memory => {
            warn!("In-memory seen-key store: discovered keys are forgotten on restart");
            Arc::new(InMemorySeenKeyStore::new())
        }
        SeenStoreBackend::File => {
            let path = config
                .path
                .as_ref()
                .context("Seen store path is required for the file backend")?;
            Arc::new(FileSeenKeyStore::open(path).await?)
        }
        SeenStoreBackend::Redis => {
            let hash_key = config
                .redis_key
                .clone()
                .unwrap_or_else(|| DEFAULT_SEEN_KEYS_HASH.to_string());
            Arc::new(RedisSeenKeyStore::new(redis.clone(), hash_key))
        }
    };
    Ok(store)
}
