//! # Stepflow Core
//!
//! Storage-free building blocks for the durable workflow engine:
//!
//! - **Definitions**: parsing and validation of declarative state graphs
//!   (`Task | Choice | Wait | Success | Fail`)
//! - **Conditions**: evaluation of Choice conditions against a JSON context
//! - **Handlers**: the [`TaskHandler`] capability interface and the registry
//!   that maps resource names to implementations
//! - **Data flow**: the shallow-merge operator applied between steps
//! - **Clock**: injectable time source so schedulers can be tested
//!   deterministically

pub mod clock;
pub mod condition;
pub mod definition;
pub mod handler;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::evaluate_condition;
pub use definition::{
    wait_run_after, ChoiceRule, Condition, DefinitionError, RetrySpec, StateDef, StateType,
    WorkflowDefinition,
};
pub use handler::{HandlerRegistry, TaskContext, TaskHandler, TaskResult};
pub use value::shallow_merge;
