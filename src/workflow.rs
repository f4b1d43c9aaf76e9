//! Workflows and their steps.
//!
//! A [`Workflow`] is an explicit table of named [`Step`]s. The dispatcher
//! never looks a step up by reflection: a client's `config.json` is checked
//! against this table when the client is loaded, and [`Workflow::call`]
//! reports an unknown name as an error instead of panicking.
//!
//! ```text
//! ┌──────────────── WorkflowCatalog ───────────────┐
//! │ "demo"    → builder(&Services) → Workflow       │
//! │ "support" → builder(&Services) → Workflow       │
//! └────────────────────────────────────────────────┘
//!                     │ resolved once per client
//!                     ▼
//!   Workflow { "rephrase" → Step, "generate" → Step, ... }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::prototypes::{self, Services};

/// A resolved option value. Configuration defaults may be booleans or
/// strings; string forms of booleans are coerced during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Text(String),
}

impl OptionValue {
    /// `Text` is truthy when non-empty.
    pub fn as_bool(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Text(s) => !s.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            OptionValue::Bool(_) => None,
        }
    }
}

/// Everything a step receives, captured by value at request time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepInput {
    /// Every declared parameter; `None` when the caller did not send it.
    pub params: BTreeMap<String, Option<String>>,
    pub options: BTreeMap<String, OptionValue>,
}

impl StepInput {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_deref())
    }

    /// Like [`param`](Self::param) but a missing or empty value is an error.
    pub fn require(&self, name: &str) -> Result<&str> {
        match self.param(name) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => bail!("Missing required parameter '{}'", name),
        }
    }

    /// Boolean option; undeclared options are `false`.
    pub fn flag(&self, name: &str) -> bool {
        self.options.get(name).is_some_and(OptionValue::as_bool)
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    /// Name used as the `step` form field and as the key in `config.json`.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, input: StepInput) -> Result<Value>;
}

pub struct Workflow {
    name: String,
    steps: BTreeMap<String, Arc<dyn Step>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a step; a step with the same name is replaced.
    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.name().to_string(), step);
    }

    pub fn with_step(mut self, step: Arc<dyn Step>) -> Self {
        self.register(step);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    pub async fn call(&self, name: &str, input: StepInput) -> Result<Value> {
        let step = self
            .find(name)
            .ok_or_else(|| anyhow!("Unknown callable {}", name))?;
        step.run(input).await
    }
}

pub type WorkflowBuilder = Arc<dyn Fn(&Services) -> Workflow + Send + Sync>;

/// Workflow builders by name. Clients pick one with `"workflow"` in their
/// `config.json` (default: the client's own name).
#[derive(Clone, Default)]
pub struct WorkflowCatalog {
    builders: BTreeMap<String, WorkflowBuilder>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the `complaint`, `demo` and `support` workflows.
    pub fn with_builtins() -> Self {
        let mut catalog = Self::new();
        catalog.register("complaint", Arc::new(prototypes::complaint_workflow));
        catalog.register("demo", Arc::new(prototypes::demo_workflow));
        catalog.register("support", Arc::new(prototypes::support_workflow));
        catalog
    }

    pub fn register(&mut self, name: &str, builder: WorkflowBuilder) {
        self.builders.insert(name.to_string(), builder);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(&self, name: &str, services: &Services) -> Option<Workflow> {
        self.builders.get(name).map(|b| b(services))
    }
}
