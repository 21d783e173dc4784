// Static partition catalog
//
// A partition set is a finite, ordered catalog of partition keys with a
// deterministic mapping from key to the step configuration of its run.

use crate::errors::ConfigurationError;
use crate::models::{PartitionKey, RunConfig};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Placeholder substituted with the partition key in config templates
pub const PARTITION_KEY_PLACEHOLDER: &str = "{partition_key}";

/// PartitionSet trait defines the catalog consumed by the cron scheduler
pub trait PartitionSet: Send + Sync {
    /// All partition keys in catalog order; stable across calls
    fn keys(&self) -> Vec<PartitionKey>;

    /// Run configuration for a single partition
    fn config_for(&self, key: &PartitionKey) -> Result<RunConfig, ConfigurationError>;
}

/// Partition set backed by a fixed key list and a source-key template.
///
/// Each partition configures one step (`step_id`) with a single field
/// (`key_field`) rendered from `template`, e.g. `prefix/stock_{partition_key}.csv`.
#[derive(Debug, Clone)]
pub struct StaticPartitionSet {
    keys: Vec<PartitionKey>,
    step_id: String,
    key_field: String,
    template: String,
}

impl StaticPartitionSet {
    /// Build a catalog, rejecting duplicate keys
    pub fn new<I, K>(
        keys: I,
        step_id: impl Into<String>,
        key_field: impl Into<String>,
        template: impl Into<String>,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = K>,
        K: Into<PartitionKey>,
    {
        let keys: Vec<PartitionKey> = keys.into_iter().map(Into::into).collect();

        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(key.as_str()) {
                return Err(ConfigurationError::DuplicatePartition(key.to_string()));
            }
        }

        Ok(Self {
            keys,
            step_id: step_id.into(),
            key_field: key_field.into(),
            template: template.into(),
        })
    }

    /// Numbered partitions "1".."=count"
    pub fn numbered(
        count: usize,
        step_id: impl Into<String>,
        key_field: impl Into<String>,
        template: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        Self::new(
            (1..=count).map(|n| n.to_string()),
            step_id,
            key_field,
            template,
        )
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl PartitionSet for StaticPartitionSet {
    fn keys(&self) -> Vec<PartitionKey> {
        self.keys.clone()
    }

    fn config_for(&self, key: &PartitionKey) -> Result<RunConfig, ConfigurationError> {
        if !self.keys.contains(key) {
            return Err(ConfigurationError::UnknownPartition(key.to_string()));
        }

        if key.as_str().trim().is_empty() {
            return Err(ConfigurationError::MalformedPartition {
                key: key.to_string(),
                reason: "partition key is blank".to_string(),
            });
        }

        if !self.template.contains(PARTITION_KEY_PLACEHOLDER) {
            return Err(ConfigurationError::MalformedPartition {
                key: key.to_string(),
                reason: format!(
                    "template '{}' has no {} placeholder",
                    self.template, PARTITION_KEY_PLACEHOLDER
                ),
            });
        }

        let source_key = self
            .template
            .replace(PARTITION_KEY_PLACEHOLDER, key.as_str());

        let mut op_config = Map::new();
        op_config.insert(self.key_field.clone(), Value::String(source_key));

        Ok(RunConfig::new().with_op_config(self.step_id.clone(), Value::Object(op_config)))
    }
}
