// Scheduler module: timer-driven triggers

pub mod engine;
pub mod outcomes;

use async_trait::async_trait;
use tokio::sync::watch;

pub use engine::{CronScheduler, TickResult};
pub use outcomes::{OutcomeTally, OutcomeTracker};

/// Trigger trait shared by the cron scheduler and polling sensors
#[async_trait]
pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Run the timer loop until `stop` is called
    async fn start(&self);

    /// Signal the timer loop to exit; a tick already emitting runs to completion
    fn stop(&self);
}

/// Resolve once shutdown is requested or the signal's sender is gone
pub(crate) async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stopped| *stopped).await;
}
