//! Workflow definition parsing and validation
//!
//! A stored `definition_json` is re-parsed into a read-only state graph each
//! time an execution is interpreted. Parsing validates the `type` discriminator
//! of every state; [`WorkflowDefinition::parse`] additionally checks graph
//! integrity (start state exists, every transition targets a known state).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error produced by definition parsing or validation.
///
/// Fatal to the execution that triggered the parse.
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The stored JSON does not deserialize into a state graph
    #[error("malformed workflow definition: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `startAt` does not name a state
    #[error("start state not found: {0}")]
    StartStateNotFound(String),

    /// A `next` or `defaultChoice` targets a state that does not exist
    #[error("state '{state}' references unknown state '{target}'")]
    UnknownTarget { state: String, target: String },

    /// A Task or Wait state is missing its `next`
    #[error("state '{0}' is missing a next state")]
    MissingNext(String),

    /// Choice state with no choices and no default
    #[error("choice state '{0}' has no choices and no default")]
    EmptyChoice(String),

    /// Wait state must carry exactly one of `seconds` / `timestamp`
    #[error("wait state '{0}' must specify exactly one of seconds or timestamp")]
    InvalidWaitSpec(String),

    /// Wait `timestamp` is not a parseable instant
    #[error("wait state '{state}' has an invalid timestamp: {value}")]
    InvalidTimestamp { state: String, value: String },
}

/// The five state kinds of the graph.
///
/// Persisted on every execution step as `step_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateType {
    Task,
    Choice,
    Wait,
    Success,
    Fail,
}

impl std::fmt::Display for StateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task => write!(f, "Task"),
            Self::Choice => write!(f, "Choice"),
            Self::Wait => write!(f, "Wait"),
            Self::Success => write!(f, "Success"),
            Self::Fail => write!(f, "Fail"),
        }
    }
}

impl StateType {
    /// Parse the persisted form back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Task" => Some(Self::Task),
            "Choice" => Some(Self::Choice),
            "Wait" => Some(Self::Wait),
            "Success" => Some(Self::Success),
            "Fail" => Some(Self::Fail),
            _ => None,
        }
    }
}

/// Retry settings accepted on Task states.
///
/// Parsed and persisted alongside the step, but never consumed by the
/// execution path: failures are terminal. Reserved for a future extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySpec {
    pub max_retries: i32,
    pub backoff_multiplier: Option<f64>,
    pub initial_interval_ms: Option<i64>,
}

/// A single Choice condition: `{operator, variable, value}`.
///
/// All fields are optional on the wire; evaluation of an incomplete condition
/// yields `false` rather than an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Condition {
    pub operator: Option<String>,
    pub variable: Option<String>,
    #[serde(default)]
    pub value: Value,
}

/// One branch of a Choice state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

/// A state definition, tagged by its `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum StateDef {
    Task {
        /// Names the handler in the task registry
        resource: Option<String>,
        next: Option<String>,
        /// Advisory handler deadline, in seconds
        timeout: Option<i64>,
        #[serde(default)]
        retry: Option<RetrySpec>,
        /// Accepted and stored, not enforced
        #[serde(default)]
        catch: Option<Value>,
    },
    Choice {
        #[serde(default)]
        choices: Vec<ChoiceRule>,
        default_choice: Option<String>,
    },
    Wait {
        seconds: Option<i64>,
        timestamp: Option<String>,
        next: Option<String>,
    },
    Success {},
    Fail {
        error: Option<String>,
        cause: Option<String>,
    },
}

impl StateDef {
    /// The state's kind.
    pub fn state_type(&self) -> StateType {
        match self {
            Self::Task { .. } => StateType::Task,
            Self::Choice { .. } => StateType::Choice,
            Self::Wait { .. } => StateType::Wait,
            Self::Success {} => StateType::Success,
            Self::Fail { .. } => StateType::Fail,
        }
    }

    /// The static `next` transition, where the state kind has one.
    pub fn next(&self) -> Option<&str> {
        match self {
            Self::Task { next, .. } | Self::Wait { next, .. } => next.as_deref(),
            _ => None,
        }
    }

    /// Advisory handler timeout for Task states.
    pub fn timeout_seconds(&self) -> Option<i64> {
        match self {
            Self::Task { timeout, .. } => *timeout,
            _ => None,
        }
    }
}

/// A parsed, validated workflow state graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub start_at: String,
    pub states: HashMap<String, StateDef>,
}

impl WorkflowDefinition {
    /// Parse stored definition JSON and validate graph integrity.
    pub fn parse(json: &Value) -> Result<Self, DefinitionError> {
        let definition: Self = serde_json::from_value(json.clone())?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse from a raw JSON string.
    pub fn parse_str(json: &str) -> Result<Self, DefinitionError> {
        let definition: Self = serde_json::from_str(json)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    /// Validate the graph: start state exists, every transition targets an
    /// existing state, Choice states can route, Wait states carry exactly one
    /// time spec.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if !self.states.contains_key(&self.start_at) {
            return Err(DefinitionError::StartStateNotFound(self.start_at.clone()));
        }

        for (name, state) in &self.states {
            match state {
                StateDef::Task { next, .. } => {
                    let target = next
                        .as_deref()
                        .ok_or_else(|| DefinitionError::MissingNext(name.clone()))?;
                    self.check_target(name, target)?;
                }
                StateDef::Choice {
                    choices,
                    default_choice,
                } => {
                    if choices.is_empty() && default_choice.is_none() {
                        return Err(DefinitionError::EmptyChoice(name.clone()));
                    }
                    for rule in choices {
                        self.check_target(name, &rule.next)?;
                    }
                    if let Some(default) = default_choice {
                        self.check_target(name, default)?;
                    }
                }
                StateDef::Wait {
                    seconds,
                    timestamp,
                    next,
                } => {
                    if seconds.is_some() == timestamp.is_some() {
                        return Err(DefinitionError::InvalidWaitSpec(name.clone()));
                    }
                    let target = next
                        .as_deref()
                        .ok_or_else(|| DefinitionError::MissingNext(name.clone()))?;
                    self.check_target(name, target)?;
                }
                StateDef::Success {} | StateDef::Fail { .. } => {}
            }
        }

        Ok(())
    }

    fn check_target(&self, state: &str, target: &str) -> Result<(), DefinitionError> {
        if self.states.contains_key(target) {
            Ok(())
        } else {
            Err(DefinitionError::UnknownTarget {
                state: state.to_string(),
                target: target.to_string(),
            })
        }
    }
}

/// Compute the instant a Wait state becomes due.
///
/// `seconds: N` yields `now + N`; `timestamp: T` is parsed as an absolute
/// instant. A parse failure is a [`DefinitionError`], fatal to the execution.
pub fn wait_run_after(
    state_name: &str,
    state: &StateDef,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, DefinitionError> {
    match state {
        StateDef::Wait {
            seconds: Some(seconds),
            ..
        } => Ok(now + chrono::Duration::seconds(*seconds)),
        StateDef::Wait {
            timestamp: Some(timestamp),
            ..
        } => DateTime::parse_from_rfc3339(timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| DefinitionError::InvalidTimestamp {
                state: state_name.to_string(),
                value: timestamp.clone(),
            }),
        _ => Err(DefinitionError::InvalidWaitSpec(state_name.to_string())),
    }
}
