//! The programmatic engine API
//!
//! Start, read and cancel executions, and register workflow definitions.
//! This is the surface a thin HTTP layer sits on; nothing here is aware of
//! request parsing or transport.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use stepflow_core::{Clock, DefinitionError, StateDef, WorkflowDefinition};
use stepflow_storage::{
    CancelOutcome, ExecutionFilter, ExecutionRecord, ExecutionStore, HistoryRecord,
    IdempotencyEntry, NewExecution, StepRecord, StoreError, VersionRecord,
};

use crate::config::EngineConfig;
use crate::interpreter::retry_params;

/// Errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("version '{version}' of workflow '{workflow}' not found")]
    VersionNotFound { workflow: String, version: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// API misuse, e.g. cancelling a completed execution
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A start request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub workflow: String,
    /// Picks the latest version (lexicographic descending) when absent
    pub version: Option<String>,
    pub input: Value,
    pub idempotency_key: Option<String>,
}

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started(ExecutionView),
    /// An unexpired idempotency key mapped the request to this execution
    Existing(ExecutionView),
}

impl StartOutcome {
    pub fn view(&self) -> &ExecutionView {
        match self {
            Self::Started(view) | Self::Existing(view) => view,
        }
    }
}

/// Read-only projection of an execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionView {
    pub execution_id: String,
    pub status: String,
    pub current_state: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<ExecutionRecord> for ExecutionView {
    fn from(record: ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id,
            status: record.status.to_string(),
            current_state: record.current_state,
            input: record.input_data,
            output: record.output_data,
            error_message: record.error_message,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

/// Read-only projection of a step.
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub status: String,
    pub input: Value,
    pub output: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<StepRecord> for StepView {
    fn from(record: StepRecord) -> Self {
        Self {
            id: record.id,
            step_name: record.step_name,
            step_type: record.step_type.to_string(),
            status: record.status.to_string(),
            input: record.input_data,
            output: record.output_data,
            error_type: record.error_type,
            error_message: record.error_message,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }
}

/// Read-only projection of a history event.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryView {
    pub id: i64,
    pub step_name: Option<String>,
    pub event_type: String,
    pub event_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl From<HistoryRecord> for HistoryView {
    fn from(record: HistoryRecord) -> Self {
        Self {
            id: record.id,
            step_name: record.step_name,
            event_type: record.event_type.as_str().to_string(),
            event_data: record.event_data,
            timestamp: record.timestamp,
        }
    }
}

/// The engine facade over the execution store.
#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: Arc<dyn ExecutionStore>, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Register a workflow version, validating the definition first.
    #[instrument(skip(self, definition_json))]
    pub async fn register_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        version: &str,
        definition_json: &Value,
    ) -> Result<VersionRecord, EngineError> {
        WorkflowDefinition::parse(definition_json)?;
        let record = self
            .store
            .register_workflow_version(name, description, version, definition_json)
            .await?;
        info!(%name, %version, "registered workflow");
        Ok(record)
    }

    /// List the stored versions of a workflow, newest first.
    pub async fn list_versions(&self, name: &str) -> Result<Vec<VersionRecord>, EngineError> {
        let workflow = self
            .store
            .find_workflow(name)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(name.to_string()))?;
        Ok(self.store.list_versions(workflow.id).await?)
    }

    /// Start an execution of a workflow against JSON input.
    #[instrument(skip(self, request), fields(workflow = %request.workflow))]
    pub async fn start_execution(
        &self,
        request: StartRequest,
    ) -> Result<StartOutcome, EngineError> {
        let now = self.clock.now();

        let workflow = self
            .store
            .find_workflow(&request.workflow)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(request.workflow.clone()))?;

        let version = match &request.version {
            Some(version) => self
                .store
                .find_version(workflow.id, version)
                .await?
                .ok_or_else(|| EngineError::VersionNotFound {
                    workflow: request.workflow.clone(),
                    version: version.clone(),
                })?,
            None => self.store.latest_version(workflow.id).await?.ok_or_else(|| {
                EngineError::VersionNotFound {
                    workflow: request.workflow.clone(),
                    version: "<latest>".to_string(),
                }
            })?,
        };

        let key_hash = request.idempotency_key.as_deref().map(hash_key);
        if let Some(hash) = &key_hash {
            if let Some(existing) = self.store.find_idempotency_key(hash, now).await? {
                let record = self.store.get_execution(existing).await?;
                debug!(execution = %record.execution_id, "idempotent start hit");
                return Ok(StartOutcome::Existing(record.into()));
            }
        }

        let definition = WorkflowDefinition::parse(&version.definition_json)?;
        let start_state = definition
            .state(&definition.start_at)
            .ok_or_else(|| DefinitionError::StartStateNotFound(definition.start_at.clone()))?;

        let run_after = match start_state {
            StateDef::Wait { .. } => Some(stepflow_core::wait_run_after(
                &definition.start_at,
                start_state,
                now,
            )?),
            _ => None,
        };

        let ttl = ChronoDuration::from_std(self.config.idempotency_ttl).unwrap_or_default();
        let new = NewExecution {
            workflow_version_id: version.id,
            execution_id: format!("exec-{}", Uuid::now_v7()),
            input: request.input.clone(),
            start_state: definition.start_at.clone(),
            start_state_type: start_state.state_type(),
            run_after,
            timeout_seconds: start_state.timeout_seconds(),
            retry: retry_params(start_state),
            idempotency: key_hash.clone().map(|key_hash| IdempotencyEntry {
                key_hash,
                expires_at: now + ttl,
            }),
        };

        match self.store.create_execution(new, now).await {
            Ok(record) => {
                info!(execution = %record.execution_id, workflow = %request.workflow, "started execution");
                Ok(StartOutcome::Started(record.into()))
            }
            Err(StoreError::Conflict(_)) if key_hash.is_some() => {
                // Lost a race on the idempotency key; the winner's execution
                // is the caller's result
                let hash = key_hash.as_deref().unwrap_or_default();
                let existing = self
                    .store
                    .find_idempotency_key(hash, now)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Conflict("idempotency key vanished during start".to_string())
                    })?;
                let record = self.store.get_execution(existing).await?;
                Ok(StartOutcome::Existing(record.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load an execution by its user-visible id.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionView, EngineError> {
        let record = self.find_execution(execution_id).await?;
        Ok(record.into())
    }

    /// List executions matching a filter.
    pub async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionView>, EngineError> {
        let records = self.store.list_executions(filter).await?;
        Ok(records.into_iter().map(ExecutionView::from).collect())
    }

    /// Load one step of an execution.
    pub async fn get_step(
        &self,
        execution_id: &str,
        step_id: Uuid,
    ) -> Result<StepView, EngineError> {
        let execution = self.find_execution(execution_id).await?;
        let step = self.store.get_step(step_id).await?;
        if step.execution_id != execution.id {
            return Err(EngineError::ExecutionNotFound(execution_id.to_string()));
        }
        Ok(step.into())
    }

    /// All steps of an execution, in creation order.
    pub async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepView>, EngineError> {
        let execution = self.find_execution(execution_id).await?;
        let steps = self.store.list_steps(execution.id).await?;
        Ok(steps.into_iter().map(StepView::from).collect())
    }

    /// The audit log of an execution, ordered by `(timestamp, id)`.
    pub async fn get_history(&self, execution_id: &str) -> Result<Vec<HistoryView>, EngineError> {
        let execution = self.find_execution(execution_id).await?;
        let history = self.store.list_history(execution.id).await?;
        Ok(history.into_iter().map(HistoryView::from).collect())
    }

    /// Cancel a running execution.
    ///
    /// Queued work is removed immediately; a step already in flight runs to
    /// handler completion and discovers the cancellation at persistence time.
    #[instrument(skip(self))]
    pub async fn cancel_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionView, EngineError> {
        let execution = self.find_execution(execution_id).await?;
        match self
            .store
            .cancel_execution(execution.id, self.clock.now())
            .await?
        {
            CancelOutcome::Cancelled(record) => {
                info!(execution = %execution_id, "cancelled execution");
                Ok(record.into())
            }
            CancelOutcome::NotRunning(record) => Err(EngineError::InvalidState(format!(
                "execution {execution_id} is {}",
                record.status
            ))),
        }
    }

    async fn find_execution(&self, execution_id: &str) -> Result<ExecutionRecord, EngineError> {
        self.store
            .find_execution_by_public_id(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }
}

fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
