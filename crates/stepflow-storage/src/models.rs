//! Persisted entity types
//!
//! Rust-side rows for the relational schema. In-memory representations carry
//! foreign keys as plain ids; the store provides join-loading where several
//! entities are needed together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepflow_core::StateType;
use uuid::Uuid;

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Step status.
///
/// Transitions follow `pending → running → (completed | failed)` or
/// `waiting → running → …`; the reaper's `running → pending` reset is the
/// only non-monotonic edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Waiting,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "waiting" => Some(Self::Waiting),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Queue row status. The row itself is the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
}

impl QueueStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
        }
    }
}

/// Audit log event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    ExecutionStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepError,
    NextStateQueued,
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    StepRecovered,
    WaitCompleted,
}

impl HistoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionStarted => "execution_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepError => "step_error",
            Self::NextStateQueued => "next_state_queued",
            Self::ExecutionCompleted => "execution_completed",
            Self::ExecutionFailed => "execution_failed",
            Self::ExecutionCancelled => "execution_cancelled",
            Self::StepRecovered => "step_recovered",
            Self::WaitCompleted => "wait_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "execution_started" => Some(Self::ExecutionStarted),
            "step_started" => Some(Self::StepStarted),
            "step_completed" => Some(Self::StepCompleted),
            "step_failed" => Some(Self::StepFailed),
            "step_error" => Some(Self::StepError),
            "next_state_queued" => Some(Self::NextStateQueued),
            "execution_completed" => Some(Self::ExecutionCompleted),
            "execution_failed" => Some(Self::ExecutionFailed),
            "execution_cancelled" => Some(Self::ExecutionCancelled),
            "step_recovered" => Some(Self::StepRecovered),
            "wait_completed" => Some(Self::WaitCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered workflow name.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stored version of a workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: String,
    pub definition_json: Value,
    /// Metadata only; never consulted by start/execution paths
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One live run of a workflow version.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_version_id: Uuid,
    /// Globally unique, user-visible id
    pub execution_id: String,
    pub status: ExecutionStatus,
    /// Optimization pointer; the queue row is authoritative
    pub current_state: String,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The instantiation of one state within an execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_name: String,
    pub step_type: StateType,
    pub status: StepStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    /// Retry bookkeeping: persisted, reserved, never consumed
    pub retry_count: i32,
    pub max_retries: i32,
    pub backoff_multiplier: Option<f64>,
    pub initial_interval_ms: Option<i64>,
    /// Advisory handler deadline, seconds
    pub timeout_seconds: Option<i64>,
    /// When a Wait step becomes due
    pub run_after_ts: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unit of work a dispatcher claims.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub priority: i32,
    /// When the item becomes eligible for claiming
    pub scheduled_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub run_after_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit log row.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub id: i64,
    pub execution_id: Uuid,
    pub step_name: Option<String>,
    pub event_type: HistoryEventType,
    pub event_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}
