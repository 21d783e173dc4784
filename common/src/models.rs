use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Partition Models
// ============================================================================

/// Opaque partition identifier, unique within a partition set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// ============================================================================
// Run Models
// ============================================================================

/// RunConfig is the configuration handed to the executor for one run.
///
/// `resources` holds connection parameters shared by every run, `ops` holds
/// per-step configuration keyed by step id. Both follow the
/// `{"<name>": {"config": {...}}}` shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub resources: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ops: BTreeMap<String, Value>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `config` block of a single step
    pub fn with_op_config(mut self, step_id: impl Into<String>, config: Value) -> Self {
        self.ops
            .insert(step_id.into(), serde_json::json!({ "config": config }));
        self
    }

    /// Set the `config` block of a resource
    pub fn with_resource_config(mut self, resource: impl Into<String>, config: Value) -> Self {
        self.resources
            .insert(resource.into(), serde_json::json!({ "config": config }));
        self
    }

    /// The `config` block of a step, if the run configures it
    pub fn op_config(&self, step_id: &str) -> Option<&Value> {
        self.ops.get(step_id).and_then(|op| op.get("config"))
    }

    /// The `config` block of a resource, if present
    pub fn resource_config(&self, resource: &str) -> Option<&Value> {
        self.resources.get(resource).and_then(|r| r.get("config"))
    }

    /// Overlay this config on top of a static base.
    ///
    /// Resources and ops from `self` win on conflicting names.
    pub fn merged_over(self, base: &RunConfig) -> RunConfig {
        let mut merged = base.clone();
        merged.resources.extend(self.resources);
        merged.ops.extend(self.ops);
        merged
    }
}

/// An immutable request to launch one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    run_key: String,
    run_config: RunConfig,
}

impl RunRequest {
    pub fn new(run_key: impl Into<String>, run_config: RunConfig) -> Self {
        Self {
            run_key: run_key.into(),
            run_config,
        }
    }

    /// Key identifying the unit of work this request intends to run exactly once
    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }
}

/// Lifecycle status of a submitted run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// Result of handing a run request to the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// The run key was already submitted; nothing was launched
    Rejected { status: RunStatus },
}

impl SubmitOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Terminal report of one run, published by the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_key: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

// ============================================================================
// Seen-Key Models
// ============================================================================

/// A discovered key that has already produced a run request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenKeyEntry {
    pub key: String,
    pub first_seen_at: DateTime<Utc>,
}

impl SeenKeyEntry {
    pub fn now(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            first_seen_at: Utc::now(),
        }
    }
}

// ============================================================================
// Tick Models
// ============================================================================

/// Per-tick accounting shared by the cron scheduler and the sensor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Run keys accepted by the executor, in emission order
    pub submitted: Vec<String>,
    /// Run keys the executor treated as an idempotent no-op
    pub rejected: Vec<String>,
    /// Keys whose request could not be built or handed off, with the reason
    pub failed: Vec<(String, String)>,
}

impl TickReport {
    /// Number of requests handed to the executor, accepted or not
    pub fn emitted(&self) -> usize {
        self.submitted.len() + self.rejected.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}
