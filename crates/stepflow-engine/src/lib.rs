//! # Stepflow Engine
//!
//! A durable workflow orchestration engine over a transactional store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │  (start / read / cancel executions, register definitions)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (PostgreSQL: executions, steps, queue, history)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  dispatch loop  — claim queue rows, interpret one state      │
//! │  wake loop      — release due Wait steps                     │
//! │  reap loop      — rescue steps stuck in running              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every transition is persisted before the next is scheduled, so a crash or
//! scale-out never loses progress and never duplicates a claim: queue rows
//! are handed out under `FOR UPDATE SKIP LOCKED` and held until the batch
//! commits.

pub mod config;
pub mod engine;
pub mod interpreter;
pub mod worker;

pub use config::{EngineConfig, WorkerConfig};
pub use engine::{
    Engine, EngineError, ExecutionView, HistoryView, StartOutcome, StartRequest, StepView,
};
pub use interpreter::{error_types, interpret_state, next_step_spec, StateOutcome};
pub use worker::{Worker, WorkerError};
