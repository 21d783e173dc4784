// Terminal outcomes of the runs a trigger emitted
//
// Outcomes are consumed for logging and counting only; they never feed back
// into which requests a trigger emits.

use crate::executor::RunExecutor;
use crate::models::{RunOutcome, RunStatus};
use crate::telemetry;
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Terminal outcome counts for one trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub succeeded: u64,
    pub failed: u64,
}

/// Follows the runs a trigger handed to its executor until they finish
pub struct OutcomeTracker {
    trigger: String,
    receiver: Mutex<Option<broadcast::Receiver<RunOutcome>>>,
    reported: bool,
    pending: Mutex<HashSet<String>>,
    tally: Mutex<OutcomeTally>,
}

impl OutcomeTracker {
    /// Subscribe to the executor's outcomes; executors without an outcome
    /// stream leave the tracker inert
    pub fn new(trigger: impl Into<String>, executor: &dyn RunExecutor) -> Self {
        let receiver = executor.outcomes();
        Self {
            trigger: trigger.into(),
            reported: receiver.is_some(),
            receiver: Mutex::new(receiver),
            pending: Mutex::new(HashSet::new()),
            tally: Mutex::new(OutcomeTally::default()),
        }
    }

    /// Start following `run_key`. Returns false if it was already followed
    /// or the executor reports no outcomes.
    pub async fn track(&self, run_key: &str) -> bool {
        if !self.reported {
            return false;
        }
        self.pending.lock().await.insert(run_key.to_string())
    }

    /// Stop following a key whose submission was not accepted
    pub async fn forget(&self, run_key: &str) {
        self.pending.lock().await.remove(run_key);
    }

    /// Next outcome published by the executor, from any trigger.
    ///
    /// Never resolves once the executor's stream has closed.
    pub async fn next_outcome(&self) -> RunOutcome {
        let mut receiver = self.receiver.lock().await;
        loop {
            let Some(rx) = receiver.as_mut() else {
                return std::future::pending().await;
            };
            match rx.recv().await {
                Ok(outcome) => return outcome,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(trigger = %self.trigger, skipped, "Run outcome stream lagged, outcomes lost");
                }
                Err(RecvError::Closed) => {
                    debug!(trigger = %self.trigger, "Run outcome stream closed");
                    *receiver = None;
                }
            }
        }
    }

    /// Log and count `outcome` if it belongs to a run this trigger emitted
    pub async fn observe(&self, outcome: &RunOutcome) -> bool {
        if outcome.status == RunStatus::Running {
            return false;
        }
        if !self.pending.lock().await.remove(&outcome.run_key) {
            return false;
        }

        let mut tally = self.tally.lock().await;
        if outcome.status == RunStatus::Succeeded {
            tally.succeeded += 1;
            info!(trigger = %self.trigger, run_key = %outcome.run_key, "Emitted run succeeded");
        } else {
            tally.failed += 1;
            warn!(
                trigger = %self.trigger,
                run_key = %outcome.run_key,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Emitted run failed"
            );
        }
        telemetry::record_trigger_run_outcome(&self.trigger, outcome.status.as_str());
        true
    }

    pub async fn tally(&self) -> OutcomeTally {
        *self.tally.lock().await
    }

    /// Runs emitted and not yet finished
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }
}
