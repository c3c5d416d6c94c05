//! ExecutionStore trait definition
//!
//! The store is the only shared resource between workers. Every mutation of
//! an execution's state happens in a single transaction; the claim protocol
//! additionally holds row-level locks on claimed queue rows for the lifetime
//! of a dispatch batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use stepflow_core::StateType;
use uuid::Uuid;

use crate::models::{
    ExecutionRecord, ExecutionStatus, HistoryRecord, QueueItem, StepRecord, VersionRecord,
    WorkflowRecord,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// A guarded update found the row in an unexpected state
    #[error("conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Retry bookkeeping persisted on a step. Reserved; never consumed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepRetryParams {
    pub max_retries: i32,
    pub backoff_multiplier: Option<f64>,
    pub initial_interval_ms: Option<i64>,
}

/// Everything needed to create an execution, its first step and its queue
/// row in one transaction.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_version_id: Uuid,
    pub execution_id: String,
    pub input: Value,
    pub start_state: String,
    pub start_state_type: StateType,
    /// Set when the start state is a Wait
    pub run_after: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub retry: StepRetryParams,
    /// Recorded atomically with the execution when a start request carries a key
    pub idempotency: Option<IdempotencyEntry>,
}

/// An idempotency-key record to write alongside a new execution.
#[derive(Debug, Clone)]
pub struct IdempotencyEntry {
    pub key_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// The successor step a transition schedules.
#[derive(Debug, Clone)]
pub struct NextStepSpec {
    pub name: String,
    pub step_type: StateType,
    pub input: Value,
    /// Set when the successor is a Wait state; also gates its queue row
    pub run_after: Option<DateTime<Utc>>,
    pub timeout_seconds: Option<i64>,
    pub retry: StepRetryParams,
}

/// Outcome of interpreting one state.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Step succeeded; schedule the successor
    Advance { output: Value, next: NextStepSpec },

    /// Terminal Success state: complete the execution
    CompleteExecution { output: Value },

    /// Terminal Fail state: the step itself completed, the execution failed
    FailWorkflow { error_message: String },

    /// Handler returned a typed failure: step and execution fail
    FailStep {
        error_type: String,
        error_message: String,
    },

    /// Interpreter-level error (bad definition, invariant violation, panic)
    ErrorStep {
        error_type: String,
        error_message: String,
    },
}

/// Which loop is applying the transition.
///
/// Dispatch transitions close a `running` step and leave queue-row removal to
/// the claim batch; wake transitions close a `waiting` step and remove the
/// execution's time-gated queue row themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Dispatch,
    Wake,
}

/// A step transition to persist atomically.
#[derive(Debug, Clone)]
pub struct StepTransition {
    pub execution_id: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub kind: TransitionKind,
    pub outcome: StepOutcome,
}

/// Result of applying a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    Applied,
    /// The execution was cancelled (or otherwise terminal) before the write;
    /// only forensic history was recorded
    ExecutionNotRunning,
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled(ExecutionRecord),
    /// Already terminal; surfaced to the caller as `InvalidState`
    NotRunning(ExecutionRecord),
}

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub status: Option<ExecutionStatus>,
    pub workflow_version_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// A batch of claimed queue rows.
///
/// The batch holds the claim open (row locks in Postgres) until `commit`.
/// Rows deleted through the batch disappear atomically at commit; dropping
/// the batch without committing releases every row unchanged.
#[async_trait]
pub trait ClaimedBatch: Send {
    /// The claimed rows, ordered by `priority DESC, scheduled_at ASC`.
    fn items(&self) -> &[QueueItem];

    /// Delete a consumed row (effective at commit).
    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), StoreError>;

    /// Commit the batch, releasing locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Transactional persistence of executions, steps, queue items and history.
///
/// Implementations must be safe for any number of concurrent worker
/// processes; the at-most-once claim guarantee comes from row-level locks
/// with skip semantics.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Register a workflow version, creating the workflow row on first use of
    /// the name. Fails with `Conflict` when `(workflow, version)` exists.
    async fn register_workflow_version(
        &self,
        name: &str,
        description: Option<&str>,
        version: &str,
        definition_json: &Value,
    ) -> Result<VersionRecord, StoreError>;

    /// Find a workflow by unique name.
    async fn find_workflow(&self, name: &str) -> Result<Option<WorkflowRecord>, StoreError>;

    /// Find a specific version of a workflow.
    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<VersionRecord>, StoreError>;

    /// The most recent version by version string, lexicographic descending.
    async fn latest_version(&self, workflow_id: Uuid) -> Result<Option<VersionRecord>, StoreError>;

    /// All versions of a workflow, newest first.
    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRecord>, StoreError>;

    /// Load a version by id.
    async fn get_version(&self, version_id: Uuid) -> Result<VersionRecord, StoreError>;

    // =========================================================================
    // Executions
    // =========================================================================

    /// Create the execution, its first step, its queue row, the
    /// `EXECUTION_STARTED` history event and (optionally) the idempotency-key
    /// record in a single transaction.
    async fn create_execution(
        &self,
        new: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Load an execution by internal id.
    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError>;

    /// Find an execution by its user-visible id.
    async fn find_execution_by_public_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// List executions matching a filter, newest first.
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Cancel a running execution: set the terminal status, remove its queue
    /// rows (skipping any row currently locked by a dispatcher) and append
    /// `EXECUTION_CANCELLED` — one transaction. Steps are not mutated.
    async fn cancel_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError>;

    /// Fail a running execution outright (engine invariant violations).
    async fn fail_execution(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Steps
    // =========================================================================

    /// Load a step by id.
    async fn get_step(&self, step_id: Uuid) -> Result<StepRecord, StoreError>;

    /// Find the most recent step of an execution with the given state name.
    async fn find_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError>;

    /// All steps of an execution in creation order.
    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    /// Mark a pending step running and append `STEP_STARTED`. Guarded: fails
    /// with `Conflict` if the step is no longer pending.
    async fn start_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Apply a step transition atomically. Re-checks the execution status
    /// under lock: a cancelled execution gets forensic history only.
    async fn apply_transition(
        &self,
        transition: &StepTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, StoreError>;

    /// Steps still `running` whose `started_at` is before the cutoff.
    async fn find_stuck_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StepRecord>, StoreError>;

    /// Reset a stuck step to pending, enqueue a fresh queue row and append
    /// `STEP_RECOVERED` — one transaction. Returns `false` when the step or
    /// its execution moved on in the meantime.
    async fn recover_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Waiting steps whose `run_after_ts` is due.
    async fn find_due_wait_steps(&self, now: DateTime<Utc>)
        -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Queue
    // =========================================================================

    /// Claim up to `limit` eligible queue rows under skip-lock semantics.
    ///
    /// An eligible row is `queued`, `scheduled_at <= now` and past its
    /// `run_after_ts` gate; claim order is `priority DESC, scheduled_at ASC`.
    /// Under N concurrent claimants each row is handed to exactly one.
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Box<dyn ClaimedBatch>, StoreError>;

    // =========================================================================
    // History
    // =========================================================================

    /// The audit log of an execution, ordered by `(timestamp, id)`.
    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRecord>, StoreError>;

    // =========================================================================
    // Idempotency keys
    // =========================================================================

    /// Resolve an unexpired idempotency key to the execution it created.
    async fn find_idempotency_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError>;

    /// Remove expired key records. Returns the number purged.
    async fn purge_expired_idempotency_keys(&self, now: DateTime<Utc>)
        -> Result<u64, StoreError>;
}
