// Run request construction
//
// Both constructors are pure: no I/O, only the trigger key plus the static
// base configuration supplied at startup.

use crate::errors::ConfigurationError;
use crate::models::{PartitionKey, RunConfig, RunRequest};
use crate::partition::PartitionSet;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Builds idempotent run requests from partition keys or discovered keys
#[derive(Clone)]
pub struct RunRequestFactory {
    base_config: RunConfig,
    partitions: Option<Arc<dyn PartitionSet>>,
    extract_step: String,
    key_field: String,
}

impl RunRequestFactory {
    /// Create a factory for discovered keys.
    ///
    /// `extract_step` and `key_field` name the step and config field that
    /// receive the discovered key (e.g. `get_s3_data` / `s3_key`).
    pub fn new(
        base_config: RunConfig,
        extract_step: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            base_config,
            partitions: None,
            extract_step: extract_step.into(),
            key_field: key_field.into(),
        }
    }

    /// Attach the partition catalog used by [`RunRequestFactory::from_partition`]
    pub fn with_partitions(mut self, partitions: Arc<dyn PartitionSet>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn partitions(&self) -> Option<&Arc<dyn PartitionSet>> {
        self.partitions.as_ref()
    }

    pub fn base_config(&self) -> &RunConfig {
        &self.base_config
    }

    /// Run request for one partition: `run_key` is the partition key itself
    pub fn from_partition(&self, key: &PartitionKey) -> Result<RunRequest, ConfigurationError> {
        let partitions = self
            .partitions
            .as_ref()
            .ok_or_else(|| ConfigurationError::UnknownPartition(key.to_string()))?;

        let partition_config = partitions.config_for(key)?;
        Ok(RunRequest::new(
            key.as_str(),
            partition_config.merged_over(&self.base_config),
        ))
    }

    /// Run request for a discovered key: `run_key` is the discovered key,
    /// and the extraction step is pointed at it
    pub fn from_discovered_key(&self, key: &str) -> RunRequest {
        let mut op_config = Map::new();
        op_config.insert(self.key_field.clone(), Value::String(key.to_string()));

        let config = RunConfig::new()
            .with_op_config(self.extract_step.clone(), Value::Object(op_config))
            .merged_over(&self.base_config);

        RunRequest::new(key, config)
    }
}
