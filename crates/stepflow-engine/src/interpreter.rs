//! State-graph interpreter
//!
//! Interprets a single state against a step's input and produces the outcome
//! the worker persists. Task handlers run in their own spawned task so a
//! panicking handler is contained and surfaces as a step failure.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::warn;

use stepflow_core::{
    evaluate_condition, shallow_merge, wait_run_after, HandlerRegistry, StateDef,
    TaskContext, TaskResult, WorkflowDefinition,
};
use stepflow_storage::{NextStepSpec, StepRetryParams};

/// Error-type strings captured into step rows.
pub mod error_types {
    pub const DEFINITION_ERROR: &str = "DefinitionError";
    pub const UNKNOWN_HANDLER: &str = "UnknownHandler";
    pub const CHOICE_ERROR: &str = "ChoiceError";
    pub const WORKFLOW_FAIL: &str = "WorkflowFail";
    pub const HANDLER_PANIC: &str = "HandlerPanic";
    pub const ENGINE_INVARIANT_VIOLATION: &str = "EngineInvariantViolation";
}

/// Outcome of interpreting one state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateOutcome {
    Success {
        output: Value,
    },
    Failure {
        error_type: String,
        error_message: String,
    },
}

impl StateOutcome {
    fn failure(error_type: &str, error_message: impl Into<String>) -> Self {
        Self::Failure {
            error_type: error_type.to_string(),
            error_message: error_message.into(),
        }
    }
}

/// Interpret one state with the given input.
///
/// Task states call their handler; Choice states route; Success and Fail
/// states terminate. Wait states are owned by the wake loop and never reach
/// the interpreter.
pub async fn interpret_state(
    registry: &HandlerRegistry,
    state_name: &str,
    state: &StateDef,
    input: &Value,
    execution_id: &str,
    now: DateTime<Utc>,
) -> StateOutcome {
    match state {
        StateDef::Task {
            resource, timeout, ..
        } => {
            let Some(handler) = resource.as_deref().and_then(|r| registry.get(r)) else {
                return StateOutcome::failure(
                    error_types::UNKNOWN_HANDLER,
                    format!(
                        "no handler registered for resource '{}'",
                        resource.as_deref().unwrap_or("<none>")
                    ),
                );
            };

            let ctx = TaskContext {
                execution_id: execution_id.to_string(),
                step_name: state_name.to_string(),
                deadline: timeout.map(|t| now + chrono::Duration::seconds(t)),
            };
            let task_input = input.clone();

            // A panicking handler must not take the worker down with it
            let handle =
                tokio::spawn(async move { handler.execute(task_input, ctx).await });
            match handle.await {
                Ok(TaskResult::Success { output }) => StateOutcome::Success { output },
                Ok(TaskResult::Failure {
                    error_type,
                    error_message,
                }) => StateOutcome::Failure {
                    error_type,
                    error_message,
                },
                Err(join_error) => {
                    let message = panic_message(join_error);
                    warn!(state = state_name, %message, "task handler panicked");
                    StateOutcome::failure(error_types::HANDLER_PANIC, message)
                }
            }
        }

        StateDef::Choice {
            choices,
            default_choice,
        } => {
            for rule in choices {
                if evaluate_condition(&rule.condition, input) {
                    return StateOutcome::Success {
                        output: json!({ "nextState": rule.next }),
                    };
                }
            }
            match default_choice {
                Some(default) => StateOutcome::Success {
                    output: json!({ "nextState": default }),
                },
                None => StateOutcome::failure(
                    error_types::CHOICE_ERROR,
                    "No matching choice and no default",
                ),
            }
        }

        StateDef::Success {} => StateOutcome::Success {
            output: input.clone(),
        },

        StateDef::Fail { error, .. } => {
            let message = error
                .clone()
                .or_else(|| {
                    input
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "Workflow failed".to_string());
            StateOutcome::failure(error_types::WORKFLOW_FAIL, message)
        }

        StateDef::Wait { .. } => StateOutcome::failure(
            error_types::ENGINE_INVARIANT_VIOLATION,
            format!("wait state '{state_name}' reached the interpreter"),
        ),
    }
}

/// Build the successor-step spec for a transition into `next_name`.
///
/// Computes the Wait deadline when the successor is a Wait state; a bad
/// `timestamp` is a definition error, fatal to the execution.
pub fn next_step_spec(
    definition: &WorkflowDefinition,
    next_name: &str,
    input: Value,
    now: DateTime<Utc>,
) -> Result<NextStepSpec, stepflow_core::DefinitionError> {
    let state = definition.state(next_name).ok_or_else(|| {
        stepflow_core::DefinitionError::UnknownTarget {
            state: "<transition>".to_string(),
            target: next_name.to_string(),
        }
    })?;

    let run_after = match state {
        StateDef::Wait { .. } => Some(wait_run_after(next_name, state, now)?),
        _ => None,
    };

    Ok(NextStepSpec {
        name: next_name.to_string(),
        step_type: state.state_type(),
        input,
        run_after,
        timeout_seconds: state.timeout_seconds(),
        retry: retry_params(state),
    })
}

/// The input for the successor of a completed step.
///
/// Choice routing objects are consumed by the worker and never merged into
/// the data flow; every other output is shallow-merged over the step's input.
pub fn successor_input(state: &StateDef, step_input: &Value, output: &Value) -> Value {
    match state {
        StateDef::Choice { .. } => step_input.clone(),
        _ => shallow_merge(step_input, output),
    }
}

/// Retry bookkeeping parsed from a Task state. Persisted, never consumed.
pub fn retry_params(state: &StateDef) -> StepRetryParams {
    match state {
        StateDef::Task {
            retry: Some(retry), ..
        } => StepRetryParams {
            max_retries: retry.max_retries,
            backoff_multiplier: retry.backoff_multiplier,
            initial_interval_ms: retry.initial_interval_ms,
        },
        _ => StepRetryParams::default(),
    }
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if join_error.is_panic() {
        let payload = join_error.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "handler panicked".to_string()
        }
    } else {
        "handler task was cancelled".to_string()
    }
}
