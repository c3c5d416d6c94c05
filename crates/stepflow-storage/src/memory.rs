//! In-memory implementation of ExecutionStore for testing
//!
//! Mirrors the PostgreSQL semantics, including the claim protocol: a batch
//! marks its rows `processing` and holds them; deletions are deferred to
//! commit, and dropping an uncommitted batch releases every row unchanged
//! (the crash case).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use stepflow_core::StateType;
use uuid::Uuid;

use crate::models::*;
use crate::store::*;

struct IdempotencyRecord {
    execution_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowRecord>,
    versions: HashMap<Uuid, VersionRecord>,
    executions: HashMap<Uuid, ExecutionRecord>,
    steps: HashMap<Uuid, StepRecord>,
    queue: HashMap<Uuid, QueueItem>,
    /// Queue rows held by an open batch (emulates row locks)
    claimed: HashSet<Uuid>,
    history: Vec<HistoryRecord>,
    next_history_id: i64,
    idempotency: HashMap<String, IdempotencyRecord>,
}

impl Inner {
    fn append_history(
        &mut self,
        execution_id: Uuid,
        step_name: Option<&str>,
        event_type: HistoryEventType,
        event_data: Option<Value>,
        now: DateTime<Utc>,
    ) {
        self.next_history_id += 1;
        self.history.push(HistoryRecord {
            id: self.next_history_id,
            execution_id,
            step_name: step_name.map(str::to_string),
            event_type,
            event_data,
            timestamp: now,
        });
    }

    fn insert_step(
        &mut self,
        execution_id: Uuid,
        step_name: &str,
        step_type: StateType,
        status: StepStatus,
        input: Value,
        run_after: Option<DateTime<Utc>>,
        timeout_seconds: Option<i64>,
        retry: &StepRetryParams,
        now: DateTime<Utc>,
    ) -> Uuid {
        let step_id = Uuid::now_v7();
        self.steps.insert(
            step_id,
            StepRecord {
                id: step_id,
                execution_id,
                step_name: step_name.to_string(),
                step_type,
                status,
                input_data: input,
                output_data: None,
                error_type: None,
                error_message: None,
                retry_count: 0,
                max_retries: retry.max_retries,
                backoff_multiplier: retry.backoff_multiplier,
                initial_interval_ms: retry.initial_interval_ms,
                timeout_seconds,
                run_after_ts: run_after,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        step_id
    }

    fn insert_queue_row(
        &mut self,
        execution_id: Uuid,
        scheduled_at: DateTime<Utc>,
        run_after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        let id = Uuid::now_v7();
        self.queue.insert(
            id,
            QueueItem {
                id,
                execution_id,
                priority: 0,
                scheduled_at,
                status: QueueStatus::Queued,
                retry_count: 0,
                run_after_ts: run_after,
                created_at: now,
            },
        );
    }

    fn delete_queue_rows(&mut self, execution_id: Uuid) {
        let ids: Vec<Uuid> = self
            .queue
            .values()
            .filter(|q| q.execution_id == execution_id)
            .map(|q| q.id)
            .collect();
        for id in ids {
            self.queue.remove(&id);
            self.claimed.remove(&id);
        }
    }

    fn fail_execution(&mut self, execution_id: Uuid, error_message: &str, now: DateTime<Utc>) {
        if let Some(execution) = self.executions.get_mut(&execution_id) {
            execution.status = ExecutionStatus::Failed;
            execution.error_message = Some(error_message.to_string());
            execution.completed_at = Some(now);
            execution.updated_at = now;
        }
    }
}

/// In-memory implementation of ExecutionStore
///
/// Primarily for tests; provides the same semantics as the PostgreSQL
/// implementation.
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queue rows currently eligible or held
    pub fn queue_len(&self) -> usize {
        self.inner.read().queue.len()
    }

    /// Number of stored executions
    pub fn execution_count(&self) -> usize {
        self.inner.read().executions.len()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn register_workflow_version(
        &self,
        name: &str,
        description: Option<&str>,
        version: &str,
        definition_json: &Value,
    ) -> Result<VersionRecord, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let workflow_id = match inner.workflows.values().find(|w| w.name == name) {
            Some(workflow) => workflow.id,
            None => {
                let id = Uuid::now_v7();
                inner.workflows.insert(
                    id,
                    WorkflowRecord {
                        id,
                        name: name.to_string(),
                        description: description.map(str::to_string),
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            }
        };

        if inner
            .versions
            .values()
            .any(|v| v.workflow_id == workflow_id && v.version == version)
        {
            return Err(StoreError::Conflict(format!(
                "version '{version}' of '{name}' already exists"
            )));
        }

        let record = VersionRecord {
            id: Uuid::now_v7(),
            workflow_id,
            version: version.to_string(),
            definition_json: definition_json.clone(),
            is_active: false,
            created_at: now,
            updated_at: now,
        };
        inner.versions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_workflow(&self, name: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.workflows.values().find(|w| w.name == name).cloned())
    }

    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<VersionRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .versions
            .values()
            .find(|v| v.workflow_id == workflow_id && v.version == version)
            .cloned())
    }

    async fn latest_version(&self, workflow_id: Uuid) -> Result<Option<VersionRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .max_by(|a, b| a.version.cmp(&b.version))
            .cloned())
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRecord>, StoreError> {
        let inner = self.inner.read();
        let mut versions: Vec<VersionRecord> = inner
            .versions
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    async fn get_version(&self, version_id: Uuid) -> Result<VersionRecord, StoreError> {
        let inner = self.inner.read();
        inner
            .versions
            .get(&version_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("workflow version {version_id}")))
    }

    async fn create_execution(
        &self,
        new: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut inner = self.inner.write();

        // Validate the idempotency claim before writing anything (the
        // Postgres implementation gets this from transaction rollback)
        if let Some(entry) = &new.idempotency {
            if let Some(existing) = inner.idempotency.get(&entry.key_hash) {
                if existing.expires_at > now {
                    return Err(StoreError::Conflict(
                        "idempotency key already mapped to a live execution".to_string(),
                    ));
                }
            }
        }

        let execution_id = Uuid::now_v7();
        let record = ExecutionRecord {
            id: execution_id,
            workflow_version_id: new.workflow_version_id,
            execution_id: new.execution_id.clone(),
            status: ExecutionStatus::Running,
            current_state: new.start_state.clone(),
            input_data: new.input.clone(),
            output_data: None,
            error_message: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.executions.insert(execution_id, record.clone());

        let step_status = if new.run_after.is_some() {
            StepStatus::Waiting
        } else {
            StepStatus::Pending
        };
        inner.insert_step(
            execution_id,
            &new.start_state,
            new.start_state_type,
            step_status,
            new.input.clone(),
            new.run_after,
            new.timeout_seconds,
            &new.retry,
            now,
        );
        inner.insert_queue_row(execution_id, new.run_after.unwrap_or(now), new.run_after, now);
        inner.append_history(
            execution_id,
            None,
            HistoryEventType::ExecutionStarted,
            Some(json!({ "input": new.input })),
            now,
        );

        if let Some(entry) = &new.idempotency {
            inner.idempotency.insert(
                entry.key_hash.clone(),
                IdempotencyRecord {
                    execution_id,
                    expires_at: entry.expires_at,
                },
            );
        }

        Ok(record)
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let inner = self.inner.read();
        inner
            .executions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
    }

    async fn find_execution_by_public_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .executions
            .values()
            .find(|e| e.execution_id == execution_id)
            .cloned())
    }

    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let inner = self.inner.read();
        let mut executions: Vec<ExecutionRecord> = inner
            .executions
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                filter
                    .workflow_version_id
                    .is_none_or(|v| e.workflow_version_id == v)
            })
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(100).max(0) as usize;
        Ok(executions.into_iter().skip(offset).take(limit).collect())
    }

    async fn cancel_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.write();

        let execution = inner
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        if execution.status != ExecutionStatus::Running {
            return Ok(CancelOutcome::NotRunning(execution.clone()));
        }
        execution.status = ExecutionStatus::Cancelled;
        execution.completed_at = Some(now);
        execution.updated_at = now;
        let record = execution.clone();

        // Skip-locked emulation: rows held by an open batch stay; their
        // dispatcher consumes them on discovering the cancelled status
        let ids: Vec<Uuid> = inner
            .queue
            .values()
            .filter(|q| q.execution_id == id && !inner.claimed.contains(&q.id))
            .map(|q| q.id)
            .collect();
        for queue_id in ids {
            inner.queue.remove(&queue_id);
        }

        inner.append_history(id, None, HistoryEventType::ExecutionCancelled, None, now);
        Ok(CancelOutcome::Cancelled(record))
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let Some(execution) = inner.executions.get(&id) else {
            return Err(StoreError::NotFound(format!("execution {id}")));
        };
        if execution.status != ExecutionStatus::Running {
            return Ok(());
        }
        inner.fail_execution(id, error_message, now);
        inner.append_history(
            id,
            None,
            HistoryEventType::ExecutionFailed,
            Some(json!({ "errorMessage": error_message })),
            now,
        );
        Ok(())
    }

    async fn get_step(&self, step_id: Uuid) -> Result<StepRecord, StoreError> {
        let inner = self.inner.read();
        inner
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("step {step_id}")))
    }

    async fn find_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id && s.step_name == step_name)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .cloned())
    }

    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read();
        let mut steps: Vec<StepRecord> = inner
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(steps)
    }

    async fn start_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let (execution_id, step_name) = {
            let step = inner
                .steps
                .get_mut(&step_id)
                .ok_or_else(|| StoreError::NotFound(format!("step {step_id}")))?;
            if step.status != StepStatus::Pending {
                return Err(StoreError::Conflict(format!("step {step_id} is not pending")));
            }
            step.status = StepStatus::Running;
            step.started_at = Some(now);
            step.updated_at = now;
            (step.execution_id, step.step_name.clone())
        };

        inner.append_history(
            execution_id,
            Some(&step_name),
            HistoryEventType::StepStarted,
            None,
            now,
        );
        Ok(())
    }

    async fn apply_transition(
        &self,
        transition: &StepTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, StoreError> {
        let mut inner = self.inner.write();

        let execution_status = inner
            .executions
            .get(&transition.execution_id)
            .map(|e| e.status)
            .ok_or_else(|| {
                StoreError::NotFound(format!("execution {}", transition.execution_id))
            })?;

        if execution_status != ExecutionStatus::Running {
            let event = match &transition.outcome {
                StepOutcome::FailStep { .. } => HistoryEventType::StepFailed,
                StepOutcome::ErrorStep { .. } => HistoryEventType::StepError,
                _ => HistoryEventType::StepCompleted,
            };
            inner.append_history(
                transition.execution_id,
                Some(&transition.step_name),
                event,
                None,
                now,
            );
            return Ok(TransitionResult::ExecutionNotRunning);
        }

        let expected_status = match transition.kind {
            TransitionKind::Dispatch => StepStatus::Running,
            TransitionKind::Wake => StepStatus::Waiting,
        };

        // Close the current step
        {
            let step = inner
                .steps
                .get_mut(&transition.step_id)
                .ok_or_else(|| StoreError::NotFound(format!("step {}", transition.step_id)))?;
            if step.status != expected_status {
                return Err(StoreError::Conflict(format!(
                    "step {} is not {expected_status}",
                    transition.step_id
                )));
            }
            match &transition.outcome {
                StepOutcome::Advance { output, .. }
                | StepOutcome::CompleteExecution { output } => {
                    step.status = StepStatus::Completed;
                    step.output_data = Some(output.clone());
                }
                StepOutcome::FailWorkflow { .. } => {
                    step.status = StepStatus::Completed;
                }
                StepOutcome::FailStep {
                    error_type,
                    error_message,
                }
                | StepOutcome::ErrorStep {
                    error_type,
                    error_message,
                } => {
                    step.status = StepStatus::Failed;
                    step.error_type = Some(error_type.clone());
                    step.error_message = Some(error_message.clone());
                }
            }
            step.completed_at = Some(now);
            step.updated_at = now;
        }

        if transition.kind == TransitionKind::Wake {
            inner.delete_queue_rows(transition.execution_id);
        }

        match &transition.outcome {
            StepOutcome::Advance { output, next } => {
                let next_status = if next.run_after.is_some() {
                    StepStatus::Waiting
                } else {
                    StepStatus::Pending
                };
                inner.insert_step(
                    transition.execution_id,
                    &next.name,
                    next.step_type,
                    next_status,
                    next.input.clone(),
                    next.run_after,
                    next.timeout_seconds,
                    &next.retry,
                    now,
                );
                let scheduled_at = next.run_after.unwrap_or(now);
                inner.insert_queue_row(transition.execution_id, scheduled_at, next.run_after, now);

                if let Some(execution) = inner.executions.get_mut(&transition.execution_id) {
                    execution.current_state = next.name.clone();
                    execution.updated_at = now;
                }

                let completed_event = match transition.kind {
                    TransitionKind::Dispatch => HistoryEventType::StepCompleted,
                    TransitionKind::Wake => HistoryEventType::WaitCompleted,
                };
                inner.append_history(
                    transition.execution_id,
                    Some(&transition.step_name),
                    completed_event,
                    Some(json!({ "output": output })),
                    now,
                );
                inner.append_history(
                    transition.execution_id,
                    Some(&next.name),
                    HistoryEventType::NextStateQueued,
                    Some(json!({ "nextState": next.name, "scheduledAt": scheduled_at })),
                    now,
                );
            }

            StepOutcome::CompleteExecution { output } => {
                if let Some(execution) = inner.executions.get_mut(&transition.execution_id) {
                    execution.status = ExecutionStatus::Completed;
                    execution.output_data = Some(output.clone());
                    execution.completed_at = Some(now);
                    execution.updated_at = now;
                }
                inner.append_history(
                    transition.execution_id,
                    Some(&transition.step_name),
                    HistoryEventType::StepCompleted,
                    Some(json!({ "output": output })),
                    now,
                );
                inner.append_history(
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionCompleted,
                    Some(json!({ "output": output })),
                    now,
                );
            }

            StepOutcome::FailWorkflow { error_message } => {
                inner.fail_execution(transition.execution_id, error_message, now);
                inner.append_history(
                    transition.execution_id,
                    Some(&transition.step_name),
                    HistoryEventType::StepCompleted,
                    None,
                    now,
                );
                inner.append_history(
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionFailed,
                    Some(json!({ "errorMessage": error_message })),
                    now,
                );
            }

            StepOutcome::FailStep {
                error_type,
                error_message,
            }
            | StepOutcome::ErrorStep {
                error_type,
                error_message,
            } => {
                let step_event = match &transition.outcome {
                    StepOutcome::FailStep { .. } => HistoryEventType::StepFailed,
                    _ => HistoryEventType::StepError,
                };
                inner.fail_execution(transition.execution_id, error_message, now);
                inner.append_history(
                    transition.execution_id,
                    Some(&transition.step_name),
                    step_event,
                    Some(json!({ "errorType": error_type, "errorMessage": error_message })),
                    now,
                );
                inner.append_history(
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionFailed,
                    Some(json!({ "errorMessage": error_message })),
                    now,
                );
            }
        }

        Ok(TransitionResult::Applied)
    }

    async fn find_stuck_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read();
        let mut stuck: Vec<StepRecord> = inner
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Running)
            .filter(|s| s.started_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect();
        stuck.sort_by_key(|s| s.started_at);
        Ok(stuck)
    }

    async fn recover_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();

        let (execution_id, step_name) = {
            let Some(step) = inner.steps.get(&step_id) else {
                return Ok(false);
            };
            if step.status != StepStatus::Running {
                return Ok(false);
            }
            let execution_running = inner
                .executions
                .get(&step.execution_id)
                .is_some_and(|e| e.status == ExecutionStatus::Running);
            if !execution_running {
                return Ok(false);
            }
            (step.execution_id, step.step_name.clone())
        };

        if let Some(step) = inner.steps.get_mut(&step_id) {
            step.status = StepStatus::Pending;
            step.started_at = None;
            step.completed_at = None;
            step.updated_at = now;
        }

        inner.insert_queue_row(execution_id, now, None, now);
        inner.append_history(
            execution_id,
            Some(&step_name),
            HistoryEventType::StepRecovered,
            None,
            now,
        );
        Ok(true)
    }

    async fn find_due_wait_steps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let inner = self.inner.read();
        let mut due: Vec<StepRecord> = inner
            .steps
            .values()
            .filter(|s| s.status == StepStatus::Waiting)
            .filter(|s| s.run_after_ts.is_some_and(|t| t <= now))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.run_after_ts);
        Ok(due)
    }

    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Box<dyn ClaimedBatch>, StoreError> {
        let mut inner = self.inner.write();

        let mut eligible: Vec<QueueItem> = inner
            .queue
            .values()
            .filter(|q| q.status == QueueStatus::Queued)
            .filter(|q| !inner.claimed.contains(&q.id))
            .filter(|q| q.scheduled_at <= now)
            .filter(|q| q.run_after_ts.is_none_or(|t| t <= now))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });
        eligible.truncate(limit.max(0) as usize);

        for item in &mut eligible {
            item.status = QueueStatus::Processing;
            inner.claimed.insert(item.id);
            if let Some(row) = inner.queue.get_mut(&item.id) {
                row.status = QueueStatus::Processing;
            }
        }

        Ok(Box::new(MemClaimedBatch {
            inner: Arc::clone(&self.inner),
            items: eligible,
            deleted: HashSet::new(),
            finished: false,
        }))
    }

    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRecord>, StoreError> {
        let inner = self.inner.read();
        let mut events: Vec<HistoryRecord> = inner
            .history
            .iter()
            .filter(|h| h.execution_id == execution_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(events)
    }

    async fn find_idempotency_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .idempotency
            .get(key_hash)
            .filter(|record| record.expires_at > now)
            .map(|record| record.execution_id))
    }

    async fn purge_expired_idempotency_keys(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.idempotency.len();
        inner.idempotency.retain(|_, record| record.expires_at > now);
        Ok((before - inner.idempotency.len()) as u64)
    }
}

/// A claimed batch over the in-memory store.
///
/// Deletions are deferred to commit; dropping without commit releases every
/// claimed row back to `queued`.
struct MemClaimedBatch {
    inner: Arc<RwLock<Inner>>,
    items: Vec<QueueItem>,
    deleted: HashSet<Uuid>,
    finished: bool,
}

#[async_trait]
impl ClaimedBatch for MemClaimedBatch {
    fn items(&self) -> &[QueueItem] {
        &self.items
    }

    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), StoreError> {
        self.deleted.insert(item_id);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for item in &self.items {
            inner.claimed.remove(&item.id);
            if self.deleted.contains(&item.id) {
                inner.queue.remove(&item.id);
            } else if let Some(row) = inner.queue.get_mut(&item.id) {
                row.status = QueueStatus::Queued;
            }
        }
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemClaimedBatch {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Uncommitted batch: release claims, discard deletions (rollback)
        let mut inner = self.inner.write();
        for item in &self.items {
            inner.claimed.remove(&item.id);
            if let Some(row) = inner.queue.get_mut(&item.id) {
                row.status = QueueStatus::Queued;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_execution(execution_id: &str) -> NewExecution {
        NewExecution {
            workflow_version_id: Uuid::now_v7(),
            execution_id: execution_id.to_string(),
            input: json!({"orderId": "X"}),
            start_state: "a".to_string(),
            start_state_type: StateType::Task,
            run_after: None,
            timeout_seconds: None,
            retry: StepRetryParams::default(),
            idempotency: None,
        }
    }

    #[tokio::test]
    async fn test_create_execution_seeds_step_queue_and_history() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let execution = store.create_execution(new_execution("exec-1"), now).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(execution.current_state, "a");
        assert_eq!(store.queue_len(), 1);

        let steps = store.list_steps(execution.id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Pending);

        let history = store.list_history(execution.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, HistoryEventType::ExecutionStarted);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        store.create_execution(new_execution("exec-1"), now).await.unwrap();

        let first = store.claim_batch(now, 10).await.unwrap();
        assert_eq!(first.items().len(), 1);

        // Second claimant skips the held row
        let second = store.claim_batch(now, 10).await.unwrap();
        assert!(second.items().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_batch_releases_rows() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        store.create_execution(new_execution("exec-1"), now).await.unwrap();

        {
            let mut batch = store.claim_batch(now, 10).await.unwrap();
            let id = batch.items()[0].id;
            batch.delete_item(id).await.unwrap();
            // Dropped without commit: the crash case
        }

        let batch = store.claim_batch(now, 10).await.unwrap();
        assert_eq!(batch.items().len(), 1, "row must be claimable again");
    }

    #[tokio::test]
    async fn test_committed_batch_removes_deleted_rows() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        store.create_execution(new_execution("exec-1"), now).await.unwrap();

        let mut batch = store.claim_batch(now, 10).await.unwrap();
        let id = batch.items()[0].id;
        batch.delete_item(id).await.unwrap();
        batch.commit().await.unwrap();

        assert_eq!(store.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_future_rows_are_not_claimable() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let mut new = new_execution("exec-1");
        new.run_after = Some(now + chrono::Duration::seconds(60));
        new.start_state_type = StateType::Wait;
        store.create_execution(new, now).await.unwrap();

        let batch = store.claim_batch(now, 10).await.unwrap();
        assert!(batch.items().is_empty());

        let later = now + chrono::Duration::seconds(61);
        let batch = store.claim_batch(later, 10).await.unwrap();
        assert_eq!(batch.items().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_removes_unclaimed_rows_and_keeps_claimed() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let execution = store.create_execution(new_execution("exec-1"), now).await.unwrap();

        let batch = store.claim_batch(now, 10).await.unwrap();
        assert_eq!(batch.items().len(), 1);

        match store.cancel_execution(execution.id, now).await.unwrap() {
            CancelOutcome::Cancelled(record) => {
                assert_eq!(record.status, ExecutionStatus::Cancelled)
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        // The claimed row survives the skip-locked delete
        assert_eq!(store.queue_len(), 1);

        // Cancelling again reports the terminal state
        match store.cancel_execution(execution.id, now).await.unwrap() {
            CancelOutcome::NotRunning(_) => {}
            other => panic!("expected NotRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recover_step_requeues() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let execution = store.create_execution(new_execution("exec-1"), now).await.unwrap();
        let step = store.find_step(execution.id, "a").await.unwrap().unwrap();

        store.start_step(step.id, now).await.unwrap();
        // Simulate the crashed dispatcher consuming the row
        let mut batch = store.claim_batch(now, 10).await.unwrap();
        let row_id = batch.items()[0].id;
        batch.delete_item(row_id).await.unwrap();
        batch.commit().await.unwrap();
        assert_eq!(store.queue_len(), 0);

        assert!(store.recover_step(step.id, now).await.unwrap());
        let step = store.get_step(step.id).await.unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.started_at.is_none());
        assert_eq!(store.queue_len(), 1);

        // A second recovery attempt is a no-op
        assert!(!store.recover_step(step.id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_idempotency_key_lifecycle() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::hours(24);

        let mut new = new_execution("exec-1");
        new.idempotency = Some(IdempotencyEntry {
            key_hash: "h1".to_string(),
            expires_at,
        });
        let execution = store.create_execution(new, now).await.unwrap();

        assert_eq!(
            store.find_idempotency_key("h1", now).await.unwrap(),
            Some(execution.id)
        );

        // Live key blocks a second execution
        let mut duplicate = new_execution("exec-2");
        duplicate.idempotency = Some(IdempotencyEntry {
            key_hash: "h1".to_string(),
            expires_at,
        });
        assert!(matches!(
            store.create_execution(duplicate, now).await,
            Err(StoreError::Conflict(_))
        ));

        // Expired key resolves to nothing and can be reused
        let after_ttl = expires_at + chrono::Duration::seconds(1);
        assert_eq!(store.find_idempotency_key("h1", after_ttl).await.unwrap(), None);
        let mut reuse = new_execution("exec-3");
        reuse.idempotency = Some(IdempotencyEntry {
            key_hash: "h1".to_string(),
            expires_at: after_ttl + chrono::Duration::hours(24),
        });
        store.create_execution(reuse, after_ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_latest_version_is_lexicographic() {
        let store = InMemoryExecutionStore::new();
        let definition = json!({"startAt": "a", "states": {"a": {"type": "Success"}}});
        store
            .register_workflow_version("order-flow", None, "1.0", &definition)
            .await
            .unwrap();
        store
            .register_workflow_version("order-flow", None, "1.2", &definition)
            .await
            .unwrap();
        store
            .register_workflow_version("order-flow", None, "1.10", &definition)
            .await
            .unwrap();

        let workflow = store.find_workflow("order-flow").await.unwrap().unwrap();
        let latest = store.latest_version(workflow.id).await.unwrap().unwrap();
        // Lexicographic, not semantic: "1.2" > "1.10"
        assert_eq!(latest.version, "1.2");
    }

    #[tokio::test]
    async fn test_duplicate_version_conflicts() {
        let store = InMemoryExecutionStore::new();
        let definition = json!({"startAt": "a", "states": {"a": {"type": "Success"}}});
        store
            .register_workflow_version("order-flow", None, "1.0", &definition)
            .await
            .unwrap();
        assert!(matches!(
            store
                .register_workflow_version("order-flow", None, "1.0", &definition)
                .await,
            Err(StoreError::Conflict(_))
        ));
    }
}
