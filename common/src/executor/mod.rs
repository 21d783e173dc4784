// Executor module for run execution
// Triggers hand run requests to a RunExecutor; the local implementation
// runs pipeline DAGs in-process.

pub mod local;
pub mod pipeline;

use crate::errors::ExecutorError;
use crate::models::{RunOutcome, RunRequest, SubmitOutcome};
use async_trait::async_trait;
use tokio::sync::broadcast;

pub use local::LocalRunExecutor;
pub use pipeline::{transform, Pipeline, Step, StepContext, StepDef, StepInput, StepOutput};

/// RunExecutor trait: the hand-off point between triggers and execution.
///
/// Submission is idempotent per run key. A second request carrying an
/// already-submitted run key returns `SubmitOutcome::Rejected` and launches
/// nothing; it is not an error.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn submit(&self, request: RunRequest) -> Result<SubmitOutcome, ExecutorError>;

    /// Terminal outcomes of runs finishing after this call, if reported
    fn outcomes(&self) -> Option<broadcast::Receiver<RunOutcome>> {
        None
    }
}
