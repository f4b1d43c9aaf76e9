//! Request dispatch: validate a step, resolve its inputs, run it.
//!
//! ```text
//! Received ──▶ Validated ──sync──▶ Completed (200)
//!                 │   └───async──▶ Accepted(task_id) (202) ──flush──▶ Executing ──▶ complete()
//!                 └──▶ Rejected (400, no task created)
//! ```
//!
//! Everything the deferred execution needs is captured in a [`DeferredStep`]
//! before the acknowledgement is returned. Nothing request-scoped is shared
//! with the continuation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{ClientRegistry, StepMode};
use crate::tasks::{TaskError, TaskRegistry};
use crate::workflow::{OptionValue, StepInput, Workflow};

/// Form field naming the step to run.
pub const STEP_FIELD: &str = "step";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown client: {0}")]
    UnknownClient(String),
    #[error("Missing form field '{}'", STEP_FIELD)]
    MissingStep,
    #[error("Invalid step: {0}")]
    UnknownStep(String),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("{0:#}")]
    Step(anyhow::Error),
}

impl DispatchError {
    /// Machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnknownClient(_) => "unknown_client",
            DispatchError::MissingStep => "missing_step",
            DispatchError::UnknownStep(_) => "invalid_step",
            DispatchError::Task(_) => "task_store",
            DispatchError::Step(_) => "step_failed",
        }
    }
}

/// Coerces the string forms of booleans; anything else stays text.
pub fn coerce_option(raw: &str) -> OptionValue {
    match raw {
        "true" | "1" => OptionValue::Bool(true),
        "false" | "0" => OptionValue::Bool(false),
        other => OptionValue::Text(other.to_string()),
    }
}

/// Every declared option takes the caller's value, else its default.
pub fn resolve_options(
    declared: &BTreeMap<String, OptionValue>,
    form: &HashMap<String, String>,
) -> BTreeMap<String, OptionValue> {
    declared
        .iter()
        .map(|(name, default)| {
            let value = match form.get(name) {
                Some(raw) => coerce_option(raw),
                None => match default {
                    OptionValue::Text(s) => coerce_option(s),
                    b => b.clone(),
                },
            };
            (name.clone(), value)
        })
        .collect()
}

/// Every declared parameter takes the caller's value, else `None`.
pub fn resolve_params(
    declared: &[String],
    form: &HashMap<String, String>,
) -> BTreeMap<String, Option<String>> {
    declared
        .iter()
        .map(|name| (name.clone(), form.get(name).cloned()))
        .collect()
}

/// Outcome of a successful dispatch.
pub enum Dispatched {
    /// Synchronous step result.
    Completed(Value),
    /// Async step accepted. `ack` is the 202 body; `deferred` must be run
    /// once the response has been flushed.
    Accepted { ack: Value, deferred: DeferredStep },
}

/// A step execution captured by value at request time.
pub struct DeferredStep {
    workflow: Arc<Workflow>,
    step: String,
    input: StepInput,
    task_id: String,
    tasks: TaskRegistry,
}

impl DeferredStep {
    /// Runs the step and records its result, or `{"error": ...}` when it
    /// fails or panics.
    pub async fn run(self) {
        let DeferredStep {
            workflow,
            step,
            input,
            task_id,
            tasks,
        } = self;

        let step_name = step.clone();
        let outcome = tokio::spawn(async move { workflow.call(&step, input).await }).await;
        let payload = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(task_id = %task_id, step = %step_name, error = %format!("{e:#}"), "Step failed");
                json!({ "error": format!("{e:#}") })
            }
            Err(join) => {
                error!(task_id = %task_id, step = %step_name, error = %join, "Step panicked");
                json!({ "error": format!("step '{}' panicked", step_name) })
            }
        };

        match tasks.complete(&task_id, payload).await {
            Ok(_) => info!(task_id = %task_id, step = %step_name, "Task done"),
            Err(e) => error!(task_id = %task_id, error = %e, "Could not record task result"),
        }
    }

    /// Spawns [`run`](Self::run) once `flushed` fires (or its sender is
    /// dropped).
    pub fn spawn_after(self, flushed: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let _ = flushed.await;
            self.run().await;
        })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    pub clients: Arc<ClientRegistry>,
    pub tasks: TaskRegistry,
}

impl Dispatcher {
    pub fn new(clients: Arc<ClientRegistry>, tasks: TaskRegistry) -> Self {
        Self { clients, tasks }
    }

    /// Validates and runs (or defers) the step named by the `step` field.
    pub async fn dispatch(
        &self,
        client_name: &str,
        form: &HashMap<String, String>,
    ) -> Result<Dispatched, DispatchError> {
        let client = self
            .clients
            .get(client_name)
            .ok_or_else(|| DispatchError::UnknownClient(client_name.to_string()))?;
        let step = form.get(STEP_FIELD).ok_or(DispatchError::MissingStep)?;
        let step_config = client
            .step(step)
            .ok_or_else(|| DispatchError::UnknownStep(step.clone()))?;

        let input = StepInput {
            params: resolve_params(&step_config.input, form),
            options: resolve_options(&client.config.options, form),
        };

        match step_config.mode {
            StepMode::Sync => {
                info!(client = %client_name, step = %step, "Running step");
                let result = client
                    .workflow
                    .call(step, input)
                    .await
                    .map_err(DispatchError::Step)?;
                Ok(Dispatched::Completed(result))
            }
            StepMode::Async => {
                let record = self.tasks.create().await?;
                info!(client = %client_name, step = %step, task_id = %record.task_id, "Accepted step");
                let ack = json!({
                    "message": format!("Step '{}' accepted", step),
                    "task_id": &record.task_id,
                    "started": &record.started,
                });
                Ok(Dispatched::Accepted {
                    ack,
                    deferred: DeferredStep {
                        workflow: client.workflow.clone(),
                        step: step.clone(),
                        input,
                        task_id: record.task_id,
                        tasks: self.tasks.clone(),
                    },
                })
            }
        }
    }
}
