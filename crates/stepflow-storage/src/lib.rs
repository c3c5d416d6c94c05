//! # Stepflow Storage
//!
//! Transactional persistence for the durable execution engine.
//!
//! The [`ExecutionStore`] trait covers executions, steps, the work queue, the
//! append-only history and idempotency keys. Two implementations:
//!
//! - [`PostgresExecutionStore`] — production, built on sqlx. Claiming uses
//!   `SELECT ... FOR UPDATE SKIP LOCKED` inside a transaction that stays open
//!   for the lifetime of the batch, so a crashed dispatcher releases its rows
//!   automatically.
//! - [`InMemoryExecutionStore`] — same semantics, for tests.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryExecutionStore;
pub use models::{
    ExecutionRecord, ExecutionStatus, HistoryEventType, HistoryRecord, QueueItem, QueueStatus,
    StepRecord, StepStatus, VersionRecord, WorkflowRecord,
};
pub use postgres::PostgresExecutionStore;
pub use store::{
    CancelOutcome, ClaimedBatch, ExecutionFilter, ExecutionStore, IdempotencyEntry, NewExecution,
    NextStepSpec, StepOutcome, StepRetryParams, StepTransition, StoreError, TransitionKind,
    TransitionResult,
};

/// Embedded schema migrations (apply with `MIGRATOR.run(&pool)`).
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
