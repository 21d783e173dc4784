// Property-based tests for the cron scheduler and the polling sensor

use async_trait::async_trait;
use chrono_tz::UTC;
use common::config::SensorConfig;
use common::errors::{DiscoveryError, ExecutorError};
use common::executor::RunExecutor;
use common::models::{RunConfig, RunRequest, RunStatus, SubmitOutcome};
use common::partition::StaticPartitionSet;
use common::request::RunRequestFactory;
use common::schedule::CronTrigger;
use common::scheduler::{CronScheduler, TickResult};
use common::seen::{InMemorySeenKeyStore, SeenKeyStore};
use common::sensor::{DiscoverySource, PollingSensor, SensorEvaluation};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Executor counting submissions per run key without deduplicating
#[derive(Default)]
struct CountingExecutor {
    submissions: Mutex<Vec<RunRequest>>,
}

impl CountingExecutor {
    fn per_key(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for request in self.submissions.lock().unwrap().iter() {
            *counts.entry(request.run_key().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl RunExecutor for CountingExecutor {
    async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
        self.submissions.lock().unwrap().push(request);
        Ok(SubmitOutcome::Accepted)
    }
}

/// Discovery source replaying one listing per tick
struct ReplaySource {
    ticks: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl DiscoverySource for ReplaySource {
    async fn list(&self, _bucket: &str, _prefix: &str) -> Result<Vec<String>, DiscoveryError> {
        let mut ticks = self.ticks.lock().unwrap();
        if ticks.is_empty() {
            return Ok(Vec::new());
        }
        Ok(ticks.remove(0))
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn sensor_config() -> SensorConfig {
    SensorConfig {
        enabled: true,
        name: "property_sensor".to_string(),
        bucket: "dagster".to_string(),
        prefix: "prefix".to_string(),
        minimum_interval_seconds: 30,
        poll_timeout_seconds: 5,
        max_keys: None,
    }
}

/// **Property: partition fan-out**
///
/// *For any* partition set of size N, one cron tick emits exactly N requests,
/// one per partition, with run_key equal to the partition key.
#[test]
fn property_cron_tick_emits_one_request_per_partition() {
    proptest!(|(keys in prop::collection::hash_set("[a-z0-9]{1,8}", 1..30))| {
        let keys: Vec<String> = keys.into_iter().collect();
        let executor = Arc::new(CountingExecutor::default());
        let partitions = StaticPartitionSet::new(
            keys.clone(),
            "get_s3_data",
            "s3_key",
            "prefix/stock_{partition_key}.csv",
        )
        .unwrap();
        let factory = RunRequestFactory::new(RunConfig::new(), "get_s3_data", "s3_key")
            .with_partitions(Arc::new(partitions));
        let scheduler = CronScheduler::new(
            "property_schedule",
            CronTrigger::new("0 * * * *", UTC).unwrap(),
            factory,
            executor.clone(),
        )
        .unwrap();

        let result = runtime().block_on(scheduler.evaluate());

        let TickResult::Completed(report) = result else {
            return Err(TestCaseError::fail("tick skipped"));
        };
        prop_assert_eq!(&report.submitted, &keys);

        let submissions = executor.submissions.lock().unwrap();
        prop_assert_eq!(submissions.len(), keys.len());
        for (request, key) in submissions.iter().zip(&keys) {
            prop_assert_eq!(request.run_key(), key.as_str());
            let expected = serde_json::json!({ "s3_key": format!("prefix/stock_{}.csv", key) });
            prop_assert_eq!(request.run_config().op_config("get_s3_data"), Some(&expected));
        }
    });
}

/// **Property: idempotent discovery**
///
/// *For any* sequence of discovery polls, each discovered key appears in at
/// most one emitted request, and every key discovered is eventually emitted.
#[test]
fn property_sensor_emits_each_key_at_most_once() {
    proptest!(|(
        ticks in prop::collection::vec(
            prop::collection::vec("[a-e]\\.csv", 0..6),
            1..8
        )
    )| {
        let executor = Arc::new(CountingExecutor::default());
        let store = Arc::new(InMemorySeenKeyStore::new());
        let tick_count = ticks.len();
        let all_keys: HashSet<String> = ticks.iter().flatten().cloned().collect();

        let sensor = PollingSensor::new(
            &sensor_config(),
            Arc::new(ReplaySource { ticks: Mutex::new(ticks) }),
            store.clone(),
            RunRequestFactory::new(RunConfig::new(), "get_s3_data", "s3_key"),
            executor.clone(),
        );

        let rt = runtime();
        for _ in 0..tick_count {
            let evaluation = rt.block_on(sensor.evaluate());
            let is_aborted = matches!(evaluation, SensorEvaluation::Aborted(_));
            prop_assert!(!is_aborted);
        }

        let counts = executor.per_key();
        prop_assert!(counts.values().all(|&count| count == 1));
        let emitted: HashSet<String> = counts.keys().cloned().collect();
        prop_assert_eq!(&emitted, &all_keys);

        let recorded = rt.block_on(store.all_keys()).unwrap();
        prop_assert_eq!(recorded, all_keys);
    });
}

/// **Property: nothing new is a skip, not a failure**
#[test]
fn property_repeated_listing_yields_skip_reason() {
    proptest!(|(keys in prop::collection::vec("[a-z]{1,6}\\.csv", 1..10))| {
        let executor = Arc::new(CountingExecutor::default());
        let sensor = PollingSensor::new(
            &sensor_config(),
            Arc::new(ReplaySource { ticks: Mutex::new(vec![keys.clone(), keys]) }),
            Arc::new(InMemorySeenKeyStore::new()),
            RunRequestFactory::new(RunConfig::new(), "get_s3_data", "s3_key"),
            executor.clone(),
        );

        let rt = runtime();
        let first = rt.block_on(sensor.evaluate());
        let emitted_first = executor.submissions.lock().unwrap().len();
        let second = rt.block_on(sensor.evaluate());

        let first_emitted = matches!(first, SensorEvaluation::Requests(_));
        let second_skipped = matches!(second, SensorEvaluation::SkipReason(_));
        prop_assert!(first_emitted);
        prop_assert!(second_skipped);
        prop_assert_eq!(executor.submissions.lock().unwrap().len(), emitted_first);
    });
}

/// Resubmission through the local executor never launches a second run
#[test]
fn test_executor_status_reported_on_rejection() {
    use common::executor::{transform, LocalRunExecutor, Pipeline, StepDef, StepOutput};
    use common::retry::RetryPolicy;
    use std::time::Duration;

    let rt = runtime();
    rt.block_on(async {
        let pipeline = Pipeline::new(
            "noop",
            vec![StepDef::new("only", transform(|_, _| Ok(StepOutput::Nothing)))],
        )
        .unwrap();
        let executor = LocalRunExecutor::new(pipeline, RetryPolicy::none(), Duration::from_secs(5));

        let request = RunRequest::new("a.csv", RunConfig::new());
        assert!(executor.submit(request.clone()).await.unwrap().accepted());
        executor.drain().await;
        assert_eq!(
            executor.submit(request).await.unwrap(),
            SubmitOutcome::Rejected {
                status: RunStatus::Succeeded
            }
        );
    });
}
