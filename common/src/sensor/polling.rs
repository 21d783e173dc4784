// Polling sensor: discovers new keys and emits one run request per key
//
// Tick phases: poll the discovery source, filter against the seen-key store,
// then record each new key before submitting its request. Ticks never overlap.

use super::discovery::DiscoverySource;
use crate::config::SensorConfig;
use crate::errors::{DiscoveryError, SeenKeyError, TickError};
use crate::executor::RunExecutor;
use crate::models::{SubmitOutcome, TickReport};
use crate::request::RunRequestFactory;
use crate::scheduler::{shutdown_requested, OutcomeTally, OutcomeTracker, Trigger};
use crate::seen::SeenKeyStore;
use crate::telemetry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Skip reason reported when a poll finds nothing new
pub const NO_NEW_KEYS_REASON: &str = "No new s3 files found in bucket.";

/// Shortest tick period the timer accepts
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Result of one sensor evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensorEvaluation {
    /// New keys were found and handed to the executor
    Requests(TickReport),
    /// Nothing new; not a failure
    SkipReason(String),
    /// A previous tick was still running
    Skipped,
    /// Discovery or seen-key lookup failed; nothing was emitted
    Aborted(TickError),
}

pub struct PollingSensor {
    name: String,
    bucket: String,
    prefix: String,
    minimum_interval: Duration,
    poll_timeout: Duration,
    source: Arc<dyn DiscoverySource>,
    seen_store: Arc<dyn SeenKeyStore>,
    factory: RunRequestFactory,
    executor: Arc<dyn RunExecutor>,
    outcomes: OutcomeTracker,
    tick_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl PollingSensor {
    pub fn new(
        config: &SensorConfig,
        source: Arc<dyn DiscoverySource>,
        seen_store: Arc<dyn SeenKeyStore>,
        factory: RunRequestFactory,
        executor: Arc<dyn RunExecutor>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name: config.name.clone(),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            minimum_interval: Duration::from_secs(config.minimum_interval_seconds)
                .max(MIN_TICK_INTERVAL),
            poll_timeout: Duration::from_secs(config.poll_timeout_seconds),
            source,
            seen_store,
            factory,
            outcomes: OutcomeTracker::new(config.name.clone(), &*executor),
            executor,
            tick_lock: Mutex::new(()),
            shutdown_tx,
        }
    }

    /// Override the tick period; clamped to at least one millisecond
    pub fn with_minimum_interval(mut self, minimum_interval: Duration) -> Self {
        self.minimum_interval = minimum_interval.max(MIN_TICK_INTERVAL);
        self
    }

    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }

    /// Terminal outcomes of the runs this sensor emitted
    pub async fn outcome_tally(&self) -> OutcomeTally {
        self.outcomes.tally().await
    }

    /// Override the discovery call bound
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Run one tick
    #[instrument(skip(self), fields(sensor = %self.name, bucket = %self.bucket, prefix = %self.prefix))]
    pub async fn evaluate(&self) -> SensorEvaluation {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("Previous sensor tick still running, skipping this tick");
            telemetry::record_missed_intervals(&self.name, 1);
            return SensorEvaluation::Skipped;
        };

        let candidates = match self.poll().await {
            Ok(keys) => keys,
            Err(e) => return self.abort(e.into()),
        };
        debug!(candidates = candidates.len(), "Discovery poll completed");

        let seen = match self.seen_store.all_keys().await {
            Ok(keys) => keys,
            Err(e) => return self.abort(e.into()),
        };

        let mut in_poll = HashSet::new();
        let new_keys: Vec<String> = candidates
            .into_iter()
            .filter(|key| !seen.contains(key) && in_poll.insert(key.clone()))
            .collect();

        if new_keys.is_empty() {
            info!(reason = NO_NEW_KEYS_REASON, "Sensor found no new work");
            telemetry::record_sensor_skip(&self.name);
            return SensorEvaluation::SkipReason(NO_NEW_KEYS_REASON.to_string());
        }

        info!(new_keys = new_keys.len(), "New keys discovered");
        SensorEvaluation::Requests(self.emit(new_keys).await)
    }

    /// Polling phase, bounded by the poll timeout and cancelled by shutdown
    async fn poll(&self) -> Result<Vec<String>, DiscoveryError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(DiscoveryError::Cancelled);
        }

        tokio::select! {
            result = tokio::time::timeout(self.poll_timeout, self.source.list(&self.bucket, &self.prefix)) => {
                match result {
                    Ok(listing) => listing,
                    Err(_) => Err(DiscoveryError::Timeout(self.poll_timeout)),
                }
            }
            _ = shutdown_requested(&mut shutdown_rx) => Err(DiscoveryError::Cancelled),
        }
    }

    /// Emitting phase: record each key, then submit its request
    async fn emit(&self, new_keys: Vec<String>) -> TickReport {
        let mut report = TickReport::default();

        for key in new_keys {
            match self.seen_store.record(&key).await {
                Ok(_) => {}
                Err(SeenKeyError::DuplicateKey(_)) => {
                    warn!(key = %key, "Key recorded concurrently by another tick, not emitting");
                    continue;
                }
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to record seen key, not emitting");
                    telemetry::record_trigger_error(&self.name, "seen_store");
                    report.failed.push((key, e.to_string()));
                    continue;
                }
            }

            let request = self.factory.from_discovered_key(&key);
            // Followed before submission so a fast run cannot finish unobserved
            let tracked = self.outcomes.track(&key).await;
            let outcome = self.executor.submit(request).await;
            if tracked && !matches!(outcome, Ok(SubmitOutcome::Accepted)) {
                self.outcomes.forget(&key).await;
            }

            match outcome {
                Ok(SubmitOutcome::Accepted) => {
                    info!(run_key = %key, "Run request submitted");
                    telemetry::record_request_emitted(&self.name);
                    report.submitted.push(key);
                }
                Ok(SubmitOutcome::Rejected { status }) => {
                    debug!(run_key = %key, status = status.as_str(), "Run key already submitted");
                    telemetry::record_request_rejected(&self.name);
                    report.rejected.push(key);
                }
                Err(e) => {
                    error!(run_key = %key, error = %e, "Failed to submit run request");
                    telemetry::record_trigger_error(&self.name, "submission");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        report
    }

    fn abort(&self, error: TickError) -> SensorEvaluation {
        error!(error = %error, "Sensor tick aborted, nothing emitted");
        let kind = match &error {
            TickError::Discovery(_) => "discovery",
            TickError::SeenKeys(_) => "seen_store",
        };
        telemetry::record_trigger_error(&self.name, kind);
        SensorEvaluation::Aborted(error)
    }
}

#[async_trait]
impl Trigger for PollingSensor {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(sensor = %self.name))]
    async fn start(&self) {
        info!(
            minimum_interval_seconds = self.minimum_interval.as_secs(),
            "Starting polling sensor"
        );

        let mut ticker = interval(self.minimum_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                outcome = self.outcomes.next_outcome() => {
                    self.outcomes.observe(&outcome).await;
                    continue;
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Shutdown signal received, stopping sensor");
                    break;
                }
            }

            let started = Instant::now();
            match self.evaluate().await {
                SensorEvaluation::Requests(report) => {
                    info!(
                        submitted = report.submitted.len(),
                        rejected = report.rejected.len(),
                        failed = report.failed.len(),
                        "Sensor tick completed"
                    );
                }
                SensorEvaluation::SkipReason(reason) => debug!(reason = %reason, "Sensor tick skipped"),
                SensorEvaluation::Skipped | SensorEvaluation::Aborted(_) => {}
            }

            let missed = missed_intervals(started.elapsed(), self.minimum_interval);
            if missed > 0 {
                warn!(missed_intervals = missed, "Sensor tick overran its interval, skipped ticks");
                telemetry::record_missed_intervals(&self.name, missed);
            }
        }

        info!("Polling sensor stopped");
    }

    fn stop(&self) {
        info!(sensor = %self.name, "Stopping polling sensor");
        self.shutdown_tx.send_replace(true);
    }
}

/// Whole intervals that elapsed while a tick was running
pub(crate) fn missed_intervals(elapsed: Duration, period: Duration) -> u64 {
    if period.is_zero() {
        return 0;
    }
    (elapsed.as_nanos() / period.as_nanos()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ExecutorError, StepError};
    use crate::executor::{transform, LocalRunExecutor, Pipeline, StepDef, StepOutput};
    use crate::models::{RunConfig, RunRequest, RunStatus, SeenKeyEntry};
    use crate::retry::RetryPolicy;
    use crate::seen::InMemorySeenKeyStore;
    use std::sync::Mutex as StdMutex;

    /// Discovery source returning scripted listings, one per call
    struct ScriptedSource {
        listings: StdMutex<Vec<Result<Vec<String>, DiscoveryError>>>,
    }

    impl ScriptedSource {
        fn new(listings: Vec<Result<Vec<String>, DiscoveryError>>) -> Arc<Self> {
            let mut listings = listings;
            listings.reverse();
            Arc::new(Self {
                listings: StdMutex::new(listings),
            })
        }
    }

    #[async_trait]
    impl DiscoverySource for ScriptedSource {
        async fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, DiscoveryError> {
            self.listings.lock().unwrap().pop().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    struct HangingSource;

    #[async_trait]
    impl DiscoverySource for HangingSource {
        async fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, DiscoveryError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    /// Executor recording every submission, accepting each run key once
    #[derive(Default)]
    struct RecordingExecutor {
        submitted: StdMutex<Vec<RunRequest>>,
    }

    #[async_trait]
    impl RunExecutor for RecordingExecutor {
        async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
            let mut submitted = self.submitted.lock().unwrap();
            if submitted.iter().any(|r| r.run_key() == request.run_key()) {
                return Ok(SubmitOutcome::Rejected {
                    status: RunStatus::Running,
                });
            }
            submitted.push(request);
            Ok(SubmitOutcome::Accepted)
        }
    }

    fn config() -> SensorConfig {
        SensorConfig {
            enabled: true,
            name: "test_sensor".to_string(),
            bucket: "dagster".to_string(),
            prefix: "prefix".to_string(),
            minimum_interval_seconds: 30,
            poll_timeout_seconds: 5,
            max_keys: None,
        }
    }

    fn factory() -> RunRequestFactory {
        RunRequestFactory::new(RunConfig::new(), "get_s3_data", "s3_key")
    }

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_only_new_keys_are_emitted() {
        let source = ScriptedSource::new(vec![
            Ok(keys(&["a.csv", "b.csv"])),
            Ok(keys(&["a.csv", "b.csv", "c.csv"])),
        ]);
        let store = Arc::new(InMemorySeenKeyStore::new());
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = PollingSensor::new(&config(), source, store.clone(), factory(), executor.clone());

        let first = sensor.evaluate().await;
        let second = sensor.evaluate().await;

        assert!(matches!(first, SensorEvaluation::Requests(ref r) if r.submitted == keys(&["a.csv", "b.csv"])));
        assert!(matches!(second, SensorEvaluation::Requests(ref r) if r.submitted == keys(&["c.csv"])));
        assert_eq!(store.len().await, 3);

        let submitted = executor.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 3);
        assert_eq!(
            submitted[2].run_config().op_config("get_s3_data"),
            Some(&serde_json::json!({"s3_key": "c.csv"}))
        );
    }

    #[tokio::test]
    async fn test_nothing_new_yields_skip_reason() {
        let source = ScriptedSource::new(vec![Ok(keys(&["a.csv"])), Ok(keys(&["a.csv"]))]);
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = PollingSensor::new(
            &config(),
            source,
            Arc::new(InMemorySeenKeyStore::new()),
            factory(),
            executor.clone(),
        );

        sensor.evaluate().await;
        let second = sensor.evaluate().await;

        assert_eq!(second, SensorEvaluation::SkipReason(NO_NEW_KEYS_REASON.to_string()));
        assert_eq!(executor.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_listing_is_a_skip_not_a_failure() {
        let sensor = PollingSensor::new(
            &config(),
            ScriptedSource::new(vec![Ok(Vec::new())]),
            Arc::new(InMemorySeenKeyStore::new()),
            factory(),
            Arc::new(RecordingExecutor::default()),
        );
        assert!(matches!(sensor.evaluate().await, SensorEvaluation::SkipReason(_)));
    }

    #[tokio::test]
    async fn test_discovery_failure_aborts_without_state_change() {
        let source = ScriptedSource::new(vec![
            Err(DiscoveryError::Unavailable("connection refused".to_string())),
            Ok(keys(&["a.csv"])),
        ]);
        let store = Arc::new(InMemorySeenKeyStore::new());
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = PollingSensor::new(&config(), source, store.clone(), factory(), executor.clone());

        let first = sensor.evaluate().await;
        assert!(matches!(first, SensorEvaluation::Aborted(TickError::Discovery(DiscoveryError::Unavailable(_)))));
        assert!(store.is_empty().await);

        // Next tick recovers
        let second = sensor.evaluate().await;
        assert!(matches!(second, SensorEvaluation::Requests(ref r) if r.submitted == keys(&["a.csv"])));
    }

    #[tokio::test]
    async fn test_duplicate_candidates_in_one_poll_emitted_once() {
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = PollingSensor::new(
            &config(),
            ScriptedSource::new(vec![Ok(keys(&["a.csv", "a.csv", "b.csv"]))]),
            Arc::new(InMemorySeenKeyStore::new()),
            factory(),
            executor.clone(),
        );

        let evaluation = sensor.evaluate().await;
        assert!(matches!(evaluation, SensorEvaluation::Requests(ref r) if r.submitted == keys(&["a.csv", "b.csv"])));
        assert_eq!(executor.submitted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_key_is_recorded_before_submission() {
        /// Executor asserting the key is already in the store when submitted
        struct CheckingExecutor {
            store: Arc<InMemorySeenKeyStore>,
        }

        #[async_trait]
        impl RunExecutor for CheckingExecutor {
            async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
                assert!(self.store.has(request.run_key()).await.unwrap());
                Ok(SubmitOutcome::Accepted)
            }
        }

        let store = Arc::new(InMemorySeenKeyStore::new());
        let sensor = PollingSensor::new(
            &config(),
            ScriptedSource::new(vec![Ok(keys(&["a.csv", "b.csv"]))]),
            store.clone(),
            factory(),
            Arc::new(CheckingExecutor { store: store.clone() }),
        );
        assert!(matches!(sensor.evaluate().await, SensorEvaluation::Requests(_)));
    }

    #[tokio::test]
    async fn test_executor_failure_is_isolated_per_key() {
        struct FlakyExecutor;

        #[async_trait]
        impl RunExecutor for FlakyExecutor {
            async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
                if request.run_key() == "a.csv" {
                    Err(ExecutorError::SubmissionFailed("queue full".to_string()))
                } else {
                    Ok(SubmitOutcome::Accepted)
                }
            }
        }

        let sensor = PollingSensor::new(
            &config(),
            ScriptedSource::new(vec![Ok(keys(&["a.csv", "b.csv"]))]),
            Arc::new(InMemorySeenKeyStore::new()),
            factory(),
            Arc::new(FlakyExecutor),
        );

        let SensorEvaluation::Requests(report) = sensor.evaluate().await else {
            panic!("expected requests");
        };
        assert_eq!(report.submitted, keys(&["b.csv"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a.csv");
    }

    #[tokio::test]
    async fn test_hung_discovery_times_out() {
        let sensor = PollingSensor::new(
            &config(),
            Arc::new(HangingSource),
            Arc::new(InMemorySeenKeyStore::new()),
            factory(),
            Arc::new(RecordingExecutor::default()),
        )
        .with_poll_timeout(Duration::from_millis(20));

        assert!(matches!(
            sensor.evaluate().await,
            SensorEvaluation::Aborted(TickError::Discovery(DiscoveryError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let sensor = Arc::new(
            PollingSensor::new(
                &config(),
                Arc::new(HangingSource),
                Arc::new(InMemorySeenKeyStore::new()),
                factory(),
                Arc::new(RecordingExecutor::default()),
            )
            .with_poll_timeout(Duration::from_secs(3600)),
        );

        let running = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { running.evaluate().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(sensor.evaluate().await, SensorEvaluation::Skipped);

        // Stopping cancels the in-flight poll
        sensor.stop();
        let first = handle.await.unwrap();
        assert_eq!(
            first,
            SensorEvaluation::Aborted(TickError::Discovery(DiscoveryError::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_start_runs_until_stopped() {
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = Arc::new(
            PollingSensor::new(
                &config(),
                ScriptedSource::new(vec![Ok(keys(&["a.csv"]))]),
                Arc::new(InMemorySeenKeyStore::new()),
                factory(),
                executor.clone(),
            )
            .with_minimum_interval(Duration::from_millis(10)),
        );

        let running = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { running.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sensor.stop();
        handle.await.unwrap();

        assert_eq!(executor.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrently_recorded_key_is_not_emitted_or_failed() {
        /// Store where another writer wins the race for `a.csv`
        struct RacyStore;

        #[async_trait]
        impl SeenKeyStore for RacyStore {
            async fn has(&self, _key: &str) -> Result<bool, SeenKeyError> {
                Ok(false)
            }

            async fn record(&self, key: &str) -> Result<SeenKeyEntry, SeenKeyError> {
                if key == "a.csv" {
                    return Err(SeenKeyError::DuplicateKey(key.to_string()));
                }
                Ok(SeenKeyEntry::now(key))
            }

            async fn all_keys(&self) -> Result<HashSet<String>, SeenKeyError> {
                Ok(HashSet::new())
            }
        }

        let executor = Arc::new(RecordingExecutor::default());
        let sensor = PollingSensor::new(
            &config(),
            ScriptedSource::new(vec![Ok(keys(&["a.csv", "b.csv"]))]),
            Arc::new(RacyStore),
            factory(),
            executor.clone(),
        );

        let SensorEvaluation::Requests(report) = sensor.evaluate().await else {
            panic!("expected requests");
        };
        assert_eq!(report.submitted, keys(&["b.csv"]));
        assert!(report.rejected.is_empty());
        assert!(report.failed.is_empty());

        let submitted = executor.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].run_key(), "b.csv");
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let executor = Arc::new(RecordingExecutor::default());
        let sensor = Arc::new(
            PollingSensor::new(
                &SensorConfig {
                    minimum_interval_seconds: 0,
                    ..config()
                },
                ScriptedSource::new(vec![Ok(keys(&["a.csv"]))]),
                Arc::new(InMemorySeenKeyStore::new()),
                factory(),
                executor.clone(),
            )
            .with_minimum_interval(Duration::ZERO),
        );
        assert_eq!(sensor.minimum_interval(), MIN_TICK_INTERVAL);

        let running = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { running.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        sensor.stop();
        handle.await.unwrap();

        assert_eq!(executor.submitted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timer_loop_observes_emitted_run_outcomes() {
        let pipeline = Pipeline::new(
            "outcomes",
            vec![StepDef::new(
                "get_s3_data",
                transform(|ctx, _| {
                    if ctx.run_key() == "b.csv" {
                        return Err(StepError::Fatal("bad rows".to_string()));
                    }
                    Ok(StepOutput::Nothing)
                }),
            )],
        )
        .unwrap();
        let executor = Arc::new(LocalRunExecutor::new(
            pipeline,
            RetryPolicy::none(),
            Duration::from_secs(5),
        ));
        let sensor = Arc::new(
            PollingSensor::new(
                &config(),
                ScriptedSource::new(vec![Ok(keys(&["a.csv", "b.csv"]))]),
                Arc::new(InMemorySeenKeyStore::new()),
                factory(),
                executor.clone(),
            )
            .with_minimum_interval(Duration::from_millis(10)),
        );

        let running = Arc::clone(&sensor);
        let handle = tokio::spawn(async move { running.start().await });

        let expected = OutcomeTally { succeeded: 1, failed: 1 };
        let mut tally = OutcomeTally::default();
        for _ in 0..200 {
            tally = sensor.outcome_tally().await;
            if tally == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sensor.stop();
        handle.await.unwrap();
        executor.drain().await;

        assert_eq!(tally, expected);
    }

    #[test]
    fn test_missed_intervals() {
        assert_eq!(missed_intervals(Duration::from_secs(5), Duration::from_secs(30)), 0);
        assert_eq!(missed_intervals(Duration::from_secs(65), Duration::from_secs(30)), 2);
        assert_eq!(missed_intervals(Duration::from_secs(65), Duration::ZERO), 0);
    }
}
