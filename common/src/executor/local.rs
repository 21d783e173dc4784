// In-process run executor
//
// Runs pipeline DAGs on the tokio runtime. Submission is idempotent per run
// key for the lifetime of the process.

use super::pipeline::{Pipeline, StepContext, StepDef, StepInput, StepOutput};
use super::RunExecutor;
use crate::errors::{ExecutorError, RunError, StepError};
use crate::models::{RunConfig, RunOutcome, RunRequest, RunStatus, SubmitOutcome};
use crate::retry::{RetryPolicy, RetryState};
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, instrument, warn, Instrument};

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// State shared between the executor handle and its run tasks
struct ExecutorState {
    pipeline: Arc<Pipeline>,
    retry_policy: RetryPolicy,
    step_timeout: Duration,
    runs: Mutex<HashMap<String, RunStatus>>,
    outcomes: broadcast::Sender<RunOutcome>,
}

pub struct LocalRunExecutor {
    state: Arc<ExecutorState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl LocalRunExecutor {
    pub fn new(pipeline: Pipeline, retry_policy: RetryPolicy, step_timeout: Duration) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(ExecutorState {
                pipeline: Arc::new(pipeline),
                retry_policy,
                step_timeout,
                runs: Mutex::new(HashMap::new()),
                outcomes,
            }),
            tasks: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Receive terminal outcomes of runs finishing after this call
    pub fn subscribe(&self) -> broadcast::Receiver<RunOutcome> {
        self.state.outcomes.subscribe()
    }

    /// Current status of a submitted run, `None` if never submitted
    pub async fn status(&self, run_key: &str) -> Option<RunStatus> {
        self.state.runs.lock().await.get(run_key).copied()
    }

    /// Wait for every in-flight run to reach a terminal status
    pub async fn drain(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(error = %e, "Run task failed to join");
                }
            }
        }
    }

    /// Stop accepting submissions and drain in-flight runs
    #[instrument(skip(self), fields(pipeline = %self.state.pipeline.name()))]
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("Run executor shutting down, draining in-flight runs");
        self.drain().await;
        info!("Run executor drained");
    }
}

#[async_trait]
impl RunExecutor for LocalRunExecutor {
    #[instrument(skip(self, request), fields(run_key = %request.run_key()))]
    async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ExecutorError::ShutDown);
        }

        {
            let mut runs = self.state.runs.lock().await;
            if let Some(status) = runs.get(request.run_key()) {
                info!(status = status.as_str(), "Run key already submitted, ignoring");
                return Ok(SubmitOutcome::Rejected { status: *status });
            }
            runs.insert(request.run_key().to_string(), RunStatus::Running);
        }

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(run_to_completion(state, request));

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        Ok(SubmitOutcome::Accepted)
    }

    fn outcomes(&self) -> Option<broadcast::Receiver<RunOutcome>> {
        Some(self.subscribe())
    }
}

/// Execute one run, record its terminal status and publish the outcome
async fn run_to_completion(state: Arc<ExecutorState>, request: RunRequest) {
    let run_key = request.run_key().to_string();
    let started = Instant::now();
    let span = info_span!("run", run_key = %run_key, pipeline = %state.pipeline.name());

    info!(parent: &span, "Run started");

    // A panicking step surfaces here as a join error instead of leaving the run Running
    let inner = tokio::spawn(
        execute_run(
            Arc::clone(&state.pipeline),
            state.retry_policy.clone(),
            state.step_timeout,
            request,
        )
        .instrument(span.clone()),
    );
    let result = match inner.await {
        Ok(result) => result,
        Err(e) => Err(RunError::Aborted(e.to_string())),
    };

    let (status, error_message) = match &result {
        Ok(()) => {
            info!(parent: &span, duration_ms = started.elapsed().as_millis() as u64, "Run succeeded");
            (RunStatus::Succeeded, None)
        }
        Err(e) => {
            error!(parent: &span, error = %e, "Run failed");
            (RunStatus::Failed, Some(e.to_string()))
        }
    };

    state.runs.lock().await.insert(run_key.clone(), status);
    telemetry::record_run_completed(status.as_str(), started.elapsed().as_secs_f64());

    // No subscribers is fine
    let _ = state.outcomes.send(RunOutcome {
        run_key,
        status,
        error: error_message,
        finished_at: Utc::now(),
    });
}

/// Walk the pipeline in topological order
async fn execute_run(
    pipeline: Arc<Pipeline>,
    policy: RetryPolicy,
    step_timeout: Duration,
    request: RunRequest,
) -> Result<(), RunError> {
    let run_config: Arc<RunConfig> = Arc::new(request.run_config().clone());
    let mut outputs: HashMap<String, StepOutput> = HashMap::new();

    for step_id in pipeline.order() {
        let def = pipeline
            .step(step_id)
            .ok_or_else(|| RunError::Aborted(format!("step '{}' missing from pipeline", step_id)))?;

        let mut input = StepInput::new();
        let mut fanned: Option<(String, Vec<Value>)> = None;
        for dep in &def.deps {
            match outputs.get(dep) {
                Some(StepOutput::Value(value)) => {
                    input.insert(dep.clone(), value.clone());
                }
                Some(StepOutput::Fanout(items)) => {
                    if fanned.is_some() {
                        return Err(RunError::StepFailed {
                            step_id: step_id.clone(),
                            attempts: 0,
                            source: StepError::Configuration(
                                "step has more than one fanned-out input".to_string(),
                            ),
                        });
                    }
                    fanned = Some((dep.clone(), items.clone()));
                }
                Some(StepOutput::Nothing) | None => {
                    input.insert(dep.clone(), Value::Null);
                }
            }
        }

        let ctx = StepContext::new(request.run_key(), step_id.clone(), Arc::clone(&run_config));
        let output = match fanned {
            None => run_step(def, &ctx, input, &policy, step_timeout).await?,
            Some((dep, items)) => {
                info!(step_id = %step_id, invocations = items.len(), "Mapping step over fanned-out input");
                let invocations = items.into_iter().map(|item| {
                    let mut mapped = input.clone();
                    mapped.insert(dep.clone(), item);
                    run_step(def, &ctx, mapped, &policy, step_timeout)
                });

                let mut collected = Vec::new();
                for result in join_all(invocations).await {
                    match result? {
                        StepOutput::Value(value) => collected.push(value),
                        StepOutput::Fanout(values) => collected.extend(values),
                        StepOutput::Nothing => {}
                    }
                }
                StepOutput::Fanout(collected)
            }
        };

        outputs.insert(step_id.clone(), output);
    }

    Ok(())
}

/// Run one step invocation under the retry policy
async fn run_step(
    def: &StepDef,
    ctx: &StepContext,
    input: StepInput,
    policy: &RetryPolicy,
    step_timeout: Duration,
) -> Result<StepOutput, RunError> {
    let mut state = RetryState::new(&def.id);

    loop {
        let result = match tokio::time::timeout(step_timeout, def.step.run(ctx, input.clone())).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout(step_timeout)),
        };

        let error = match result {
            Ok(output) => {
                if state.attempts() > 0 {
                    info!(step_id = %def.id, attempts = state.attempts() + 1, "Step succeeded after retry");
                }
                return Ok(output);
            }
            Err(e) => e,
        };

        let decision = state.record_failure(policy, error.clone());
        if !decision.retry {
            error!(
                step_id = %def.id,
                attempts = state.attempts(),
                retriable = policy.is_retriable(&error),
                error = %error,
                "Step failed permanently"
            );
            return Err(RunError::StepFailed {
                step_id: def.id.clone(),
                attempts: state.attempts(),
                source: error,
            });
        }

        warn!(
            step_id = %def.id,
            attempt = state.attempts(),
            max_retries = policy.max_retries(),
            delay_ms = decision.delay.as_millis() as u64,
            error = %error,
            "Step failed, retrying"
        );
        telemetry::record_step_retry(&def.id);
        tokio::time::sleep(decision.delay).await;
    }
}
