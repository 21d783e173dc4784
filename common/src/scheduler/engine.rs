// Cron scheduler: partition fan-out on every cron tick

use super::outcomes::{OutcomeTally, OutcomeTracker};
use super::{shutdown_requested, Trigger};
use crate::errors::ConfigurationError;
use crate::executor::RunExecutor;
use crate::models::{SubmitOutcome, TickReport};
use crate::partition::PartitionSet;
use crate::request::RunRequestFactory;
use crate::schedule::CronTrigger;
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

/// Result of one cron evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickResult {
    Completed(TickReport),
    /// A previous tick was still emitting
    Skipped,
}

/// Emits one run request per partition on each tick of a cron expression
pub struct CronScheduler {
    name: String,
    trigger: CronTrigger,
    partitions: Arc<dyn PartitionSet>,
    factory: RunRequestFactory,
    executor: Arc<dyn RunExecutor>,
    outcomes: OutcomeTracker,
    tick_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl CronScheduler {
    /// Create a scheduler; the factory must carry a partition catalog
    pub fn new(
        name: impl Into<String>,
        trigger: CronTrigger,
        factory: RunRequestFactory,
        executor: Arc<dyn RunExecutor>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let partitions = factory.partitions().cloned().ok_or_else(|| {
            ConfigurationError::InvalidSettings(format!(
                "schedule '{}' has no partition catalog",
                name
            ))
        })?;
        let (shutdown_tx, _) = watch::channel(false);
        let outcomes = OutcomeTracker::new(name.clone(), &*executor);

        Ok(Self {
            name,
            trigger,
            partitions,
            factory,
            executor,
            outcomes,
            tick_lock: Mutex::new(()),
            shutdown_tx,
        })
    }

    /// Terminal outcomes of the runs this schedule emitted
    pub async fn outcome_tally(&self) -> OutcomeTally {
        self.outcomes.tally().await
    }

    /// Run one tick: fan out over every partition in catalog order.
    ///
    /// A partition whose request cannot be built or submitted is reported in
    /// `TickReport::failed`; the remaining partitions still run.
    #[instrument(skip(self), fields(schedule = %self.name))]
    pub async fn evaluate(&self) -> TickResult {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("Previous schedule tick still emitting, skipping this tick");
            telemetry::record_missed_intervals(&self.name, 1);
            return TickResult::Skipped;
        };

        let mut report = TickReport::default();

        for key in self.partitions.keys() {
            let request = match self.factory.from_partition(&key) {
                Ok(request) => request,
                Err(e) => {
                    error!(partition = %key, error = %e, "Failed to build run request for partition");
                    telemetry::record_trigger_error(&self.name, "configuration");
                    report.failed.push((key.to_string(), e.to_string()));
                    continue;
                }
            };

            let tracked = self.outcomes.track(key.as_str()).await;
            let outcome = self.executor.submit(request).await;
            if tracked && !matches!(outcome, Ok(SubmitOutcome::Accepted)) {
                self.outcomes.forget(key.as_str()).await;
            }

            match outcome {
                Ok(SubmitOutcome::Accepted) => {
                    debug!(partition = %key, "Run request submitted");
                    telemetry::record_request_emitted(&self.name);
                    report.submitted.push(key.to_string());
                }
                Ok(SubmitOutcome::Rejected { status }) => {
                    debug!(partition = %key, status = status.as_str(), "Run key already submitted");
                    telemetry::record_request_rejected(&self.name);
                    report.rejected.push(key.to_string());
                }
                Err(e) => {
                    error!(partition = %key, error = %e, "Failed to submit run request");
                    telemetry::record_trigger_error(&self.name, "submission");
                    report.failed.push((key.to_string(), e.to_string()));
                }
            }
        }

        info!(
            submitted = report.submitted.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            "Schedule tick completed"
        );
        TickResult::Completed(report)
    }
}

#[async_trait]
impl Trigger for CronScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(schedule = %self.name, cron = %self.trigger.expression()))]
    async fn start(&self) {
        info!(timezone = %self.trigger.timezone(), "Starting cron scheduler");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut reference = Utc::now();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let Some(next) = self.trigger.next_after(reference) else {
                warn!("Cron expression has no upcoming fire times, stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(next_fire = %next, wait_ms = wait.as_millis() as u64, "Waiting for next cron tick");

            tokio::select! {
                _ = sleep(wait) => {}
                outcome = self.outcomes.next_outcome() => {
                    self.outcomes.observe(&outcome).await;
                    continue;
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }

            self.evaluate().await;

            // Fire times that passed while emitting are skipped, not queued
            let now = Utc::now();
            let missed = self.trigger.fires_between(next, now);
            if missed > 0 {
                warn!(missed_intervals = missed, "Schedule tick overran, skipped fire times");
                telemetry::record_missed_intervals(&self.name, missed as u64);
            }
            reference = now.max(next);
        }

        info!("Cron scheduler stopped");
    }

    fn stop(&self) {
        info!(schedule = %self.name, "Stopping cron scheduler");
        self.shutdown_tx.send_replace(true);
    }
}
