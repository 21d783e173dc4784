// Pipeline DAG definition
//
// Steps are registered explicitly with their dependencies; construction
// validates the graph and fixes a deterministic execution order.

use crate::errors::{ConfigurationError, StepError};
use crate::models::RunConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Upstream outputs keyed by dependency step id
pub type StepInput = BTreeMap<String, Value>;

/// Output of one step invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Value(Value),
    /// One item per downstream invocation
    Fanout(Vec<Value>),
    Nothing,
}

/// Run-scoped context handed to every step invocation
#[derive(Debug, Clone)]
pub struct StepContext {
    run_key: String,
    step_id: String,
    run_config: Arc<RunConfig>,
}

impl StepContext {
    pub fn new(
        run_key: impl Into<String>,
        step_id: impl Into<String>,
        run_config: Arc<RunConfig>,
    ) -> Self {
        Self {
            run_key: run_key.into(),
            step_id: step_id.into(),
            run_config,
        }
    }

    pub fn run_key(&self) -> &str {
        &self.run_key
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    /// This step's `config` block from the run config
    pub fn op_config(&self) -> Option<&Value> {
        self.run_config.op_config(&self.step_id)
    }

    /// Required string field of this step's config
    pub fn config_str(&self, field: &str) -> Result<&str, StepError> {
        self.op_config()
            .and_then(|config| config.get(field))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepError::Configuration(format!(
                    "step '{}' requires string config field '{}'",
                    self.step_id, field
                ))
            })
    }

    /// Optional unsigned integer field of this step's config
    pub fn config_u64(&self, field: &str) -> Result<Option<u64>, StepError> {
        match self.op_config().and_then(|config| config.get(field)) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value.as_u64().map(Some).ok_or_else(|| {
                StepError::Configuration(format!(
                    "step '{}' config field '{}' must be a non-negative integer",
                    self.step_id, field
                ))
            }),
        }
    }
}

/// Step trait: one node of the pipeline DAG
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutput, StepError>;
}

/// Adapter turning a pure function into a step
pub struct FnStep<F> {
    f: F,
}

#[async_trait]
impl<F> Step for FnStep<F>
where
    F: Fn(&StepContext, StepInput) -> Result<StepOutput, StepError> + Send + Sync,
{
    async fn run(&self, ctx: &StepContext, input: StepInput) -> Result<StepOutput, StepError> {
        (self.f)(ctx, input)
    }
}

/// Wrap a pure transform as a step
pub fn transform<F>(f: F) -> Arc<dyn Step>
where
    F: Fn(&StepContext, StepInput) -> Result<StepOutput, StepError> + Send + Sync + 'static,
{
    Arc::new(FnStep { f })
}

/// A step registered under an id with its upstream dependencies
#[derive(Clone)]
pub struct StepDef {
    pub id: String,
    pub deps: Vec<String>,
    pub step: Arc<dyn Step>,
}

impl StepDef {
    pub fn new(id: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            id: id.into(),
            deps: Vec::new(),
            step,
        }
    }

    /// Declare an upstream dependency
    pub fn after(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }
}

impl fmt::Debug for StepDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDef")
            .field("id", &self.id)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// Validated DAG of steps
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    steps: HashMap<String, StepDef>,
    order: Vec<String>,
}

impl Pipeline {
    /// Validate the graph and compute its execution order.
    ///
    /// Ties in the topological order are broken by declaration order.
    pub fn new(name: impl Into<String>, defs: Vec<StepDef>) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if defs.is_empty() {
            return Err(ConfigurationError::InvalidPipeline(format!(
                "pipeline '{}' has no steps",
                name
            )));
        }

        let mut index = HashMap::with_capacity(defs.len());
        for (position, def) in defs.iter().enumerate() {
            if index.insert(def.id.clone(), position).is_some() {
                return Err(ConfigurationError::InvalidPipeline(format!(
                    "duplicate step id '{}'",
                    def.id
                )));
            }
        }

        let mut in_degree = vec![0usize; defs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        for (position, def) in defs.iter().enumerate() {
            let mut unique = HashSet::new();
            for dep in &def.deps {
                let dep_position = *index.get(dep).ok_or_else(|| {
                    ConfigurationError::InvalidPipeline(format!(
                        "step '{}' depends on unknown step '{}'",
                        def.id, dep
                    ))
                })?;
                if unique.insert(dep_position) {
                    in_degree[position] += 1;
                    dependents[dep_position].push(position);
                }
            }
        }

        let mut ready: VecDeque<usize> = (0..defs.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(defs.len());
        while let Some(position) = ready.pop_front() {
            order.push(defs[position].id.clone());
            let mut unlocked = Vec::new();
            for &dependent in &dependents[position] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    unlocked.push(dependent);
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if order.len() != defs.len() {
            return Err(ConfigurationError::InvalidPipeline(format!(
                "pipeline '{}' contains a dependency cycle",
                name
            )));
        }

        let steps = defs.into_iter().map(|def| (def.id.clone(), def)).collect();
        Ok(Self { name, steps, order })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step ids in execution order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn step(&self, id: &str) -> Option<&StepDef> {
        self.steps.get(id)
    }
}
