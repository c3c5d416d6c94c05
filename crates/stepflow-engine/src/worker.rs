//! Worker: the dispatch, reap and wake loops
//!
//! All three loops are safe to run concurrently across any number of process
//! instances; coordination happens entirely through the store's row locks.
//! Each loop exposes a single-tick entry point (`dispatch_once`, `reap_once`,
//! `wake_once`) used by the periodic loops and by deterministic tests.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use stepflow_core::{Clock, HandlerRegistry, StateDef, StateType, WorkflowDefinition};
use stepflow_storage::{
    ExecutionRecord, ExecutionStatus, ExecutionStore, QueueItem, StepOutcome, StepRecord,
    StepStatus, StepTransition, StoreError, TransitionKind,
};

use crate::config::WorkerConfig;
use crate::interpreter::{
    error_types, interpret_state, next_step_spec, successor_input, StateOutcome,
};

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What to do with a claimed queue row after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowDisposition {
    /// Delete the row (normal consumption, stale rows, cancelled executions)
    Consume,
    /// Leave the row in place (Wait rows owned by the wake loop)
    Leave,
}

/// Drives executions against the shared store.
pub struct Worker {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            registry,
            clock,
            config,
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the three periodic loops.
    pub fn start(self: &Arc<Self>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            wake_interval_ms = self.config.wake_interval.as_millis() as u64,
            reap_interval_ms = self.config.reap_interval.as_millis() as u64,
            "starting worker loops"
        );
        self.start_dispatch_loop();
        self.start_wake_loop();
        self.start_reap_loop();
    }

    /// Signal shutdown and wait for the loops to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("worker stopped");
    }

    fn start_dispatch_loop(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // The loop must never die: errors are logged and the
                        // next tick proceeds
                        match worker.dispatch_once().await {
                            Ok(count) if count > 0 => debug!(count, "dispatched queue items"),
                            Ok(_) => {}
                            Err(e) => error!("dispatch tick failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("dispatch loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("dispatch loop exited");
        });
        self.handles.lock().unwrap().push(handle);
    }

    fn start_wake_loop(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.wake_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match worker.wake_once().await {
                            Ok(count) if count > 0 => debug!(count, "woke wait steps"),
                            Ok(_) => {}
                            Err(e) => error!("wake tick failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("wake loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("wake loop exited");
        });
        self.handles.lock().unwrap().push(handle);
    }

    fn start_reap_loop(self: &Arc<Self>) {
        let worker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match worker.reap_once().await {
                            Ok(count) if count > 0 => info!(count, "recovered stuck steps"),
                            Ok(_) => {}
                            Err(e) => error!("reap tick failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reap loop: shutdown requested");
                        break;
                    }
                }
            }
            debug!("reap loop exited");
        });
        self.handles.lock().unwrap().push(handle);
    }

    /// One dispatch poll: claim a batch, interpret one state per row, commit.
    ///
    /// Returns the number of rows consumed.
    #[instrument(skip(self))]
    pub async fn dispatch_once(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now();
        let mut batch = self.store.claim_batch(now, self.config.batch_size).await?;
        let items = batch.items().to_vec();

        let mut consumed = 0;
        for item in &items {
            match self.process_item(item).await {
                Ok(RowDisposition::Consume) => {
                    batch.delete_item(item.id).await?;
                    consumed += 1;
                }
                Ok(RowDisposition::Leave) => {}
                Err(e) => {
                    // Leave the row claimable; the next poll (or the reaper)
                    // picks up where this one failed
                    warn!(queue_item = %item.id, "failed to process queue item: {}", e);
                }
            }
        }

        batch.commit().await?;
        Ok(consumed)
    }

    /// Process one claimed queue row.
    async fn process_item(&self, item: &QueueItem) -> Result<RowDisposition, WorkerError> {
        let now = self.clock.now();

        let execution = match self.store.get_execution(item.execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound(_)) => return Ok(RowDisposition::Consume),
            Err(e) => return Err(e.into()),
        };
        if execution.status != ExecutionStatus::Running {
            // Cancelled or already terminal; the row is stale
            return Ok(RowDisposition::Consume);
        }

        let step = match self
            .store
            .find_step(execution.id, &execution.current_state)
            .await?
        {
            Some(step) => step,
            None => {
                warn!(
                    execution = %execution.execution_id,
                    state = %execution.current_state,
                    "execution has no step for its current state"
                );
                self.store
                    .fail_execution(
                        execution.id,
                        &format!(
                            "no step found for current state '{}'",
                            execution.current_state
                        ),
                        now,
                    )
                    .await?;
                return Ok(RowDisposition::Consume);
            }
        };

        match step.status {
            // The wake loop owns wait steps; this branch is a safety net
            StepStatus::Waiting => return Ok(RowDisposition::Leave),
            // In flight on another worker, or crashed mid-step: the reaper
            // is the backstop for the latter
            StepStatus::Running => return Ok(RowDisposition::Consume),
            // A crash between outcome commit and queue delete leaves a stale row
            StepStatus::Completed | StepStatus::Failed => return Ok(RowDisposition::Consume),
            StepStatus::Pending => {}
        }
        if step.step_type == StateType::Wait {
            return Ok(RowDisposition::Leave);
        }

        // Resolve the definition before marking the step running so that a
        // transient store failure here leaves the step untouched
        let version = self.store.get_version(execution.workflow_version_id).await?;
        let parsed = WorkflowDefinition::parse(&version.definition_json);

        self.store.start_step(step.id, now).await?;

        let outcome = match parsed {
            Ok(definition) => self.run_state(&execution, &step, &definition).await,
            Err(e) => StepOutcome::ErrorStep {
                error_type: error_types::DEFINITION_ERROR.to_string(),
                error_message: e.to_string(),
            },
        };

        self.store
            .apply_transition(
                &StepTransition {
                    execution_id: execution.id,
                    step_id: step.id,
                    step_name: step.step_name.clone(),
                    kind: TransitionKind::Dispatch,
                    outcome,
                },
                self.clock.now(),
            )
            .await?;

        Ok(RowDisposition::Consume)
    }

    /// Interpret the step's state and shape the persistable outcome.
    async fn run_state(
        &self,
        execution: &ExecutionRecord,
        step: &StepRecord,
        definition: &WorkflowDefinition,
    ) -> StepOutcome {
        let now = self.clock.now();

        let Some(state) = definition.state(&step.step_name) else {
            return StepOutcome::ErrorStep {
                error_type: error_types::DEFINITION_ERROR.to_string(),
                error_message: format!("state '{}' not found in definition", step.step_name),
            };
        };

        let outcome = interpret_state(
            &self.registry,
            &step.step_name,
            state,
            &step.input_data,
            &execution.execution_id,
            now,
        )
        .await;

        match outcome {
            StateOutcome::Failure {
                error_type,
                error_message,
            } => {
                if error_type == error_types::WORKFLOW_FAIL {
                    StepOutcome::FailWorkflow { error_message }
                } else {
                    StepOutcome::FailStep {
                        error_type,
                        error_message,
                    }
                }
            }
            StateOutcome::Success { output } => {
                let next_name = match state {
                    StateDef::Choice { .. } => {
                        match output.get("nextState").and_then(serde_json::Value::as_str) {
                            Some(next) => Some(next.to_string()),
                            None => {
                                return StepOutcome::ErrorStep {
                                    error_type: error_types::ENGINE_INVARIANT_VIOLATION
                                        .to_string(),
                                    error_message: "choice produced no next state".to_string(),
                                }
                            }
                        }
                    }
                    _ => state.next().map(str::to_string),
                };

                match next_name {
                    // Terminal Success: no next for the current state
                    None => StepOutcome::CompleteExecution { output },
                    Some(next_name) => {
                        let input = successor_input(state, &step.input_data, &output);
                        match next_step_spec(definition, &next_name, input, now) {
                            Ok(next) => StepOutcome::Advance { output, next },
                            Err(e) => StepOutcome::ErrorStep {
                                error_type: error_types::DEFINITION_ERROR.to_string(),
                                error_message: e.to_string(),
                            },
                        }
                    }
                }
            }
        }
    }

    /// One wake poll: release due Wait steps. Returns the number woken.
    #[instrument(skip(self))]
    pub async fn wake_once(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now();
        let due = self.store.find_due_wait_steps(now).await?;

        let mut woken = 0;
        for step in due {
            match self.wake_step(&step).await {
                Ok(true) => woken += 1,
                Ok(false) => {}
                Err(e) => warn!(step = %step.step_name, "failed to wake step: {}", e),
            }
        }
        Ok(woken)
    }

    /// Complete one due Wait step and schedule its successor.
    async fn wake_step(&self, step: &StepRecord) -> Result<bool, WorkerError> {
        let now = self.clock.now();

        let execution = match self.store.get_execution(step.execution_id).await {
            Ok(execution) => execution,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if execution.status != ExecutionStatus::Running {
            return Ok(false);
        }

        let version = self.store.get_version(execution.workflow_version_id).await?;
        let outcome = match WorkflowDefinition::parse(&version.definition_json) {
            Ok(definition) => match definition.state(&step.step_name) {
                Some(state @ StateDef::Wait { .. }) => match state.next() {
                    Some(next_name) => {
                        let output = json!({ "waitCompleted": true });
                        let input = successor_input(state, &step.input_data, &output);
                        match next_step_spec(&definition, next_name, input, now) {
                            Ok(next) => StepOutcome::Advance { output, next },
                            Err(e) => StepOutcome::ErrorStep {
                                error_type: error_types::DEFINITION_ERROR.to_string(),
                                error_message: e.to_string(),
                            },
                        }
                    }
                    None => StepOutcome::ErrorStep {
                        error_type: error_types::DEFINITION_ERROR.to_string(),
                        error_message: format!("wait state '{}' has no next", step.step_name),
                    },
                },
                Some(_) => StepOutcome::ErrorStep {
                    error_type: error_types::ENGINE_INVARIANT_VIOLATION.to_string(),
                    error_message: format!(
                        "waiting step '{}' is not a wait state",
                        step.step_name
                    ),
                },
                None => StepOutcome::ErrorStep {
                    error_type: error_types::DEFINITION_ERROR.to_string(),
                    error_message: format!("state '{}' not found in definition", step.step_name),
                },
            },
            Err(e) => StepOutcome::ErrorStep {
                error_type: error_types::DEFINITION_ERROR.to_string(),
                error_message: e.to_string(),
            },
        };

        self.store
            .apply_transition(
                &StepTransition {
                    execution_id: step.execution_id,
                    step_id: step.id,
                    step_name: step.step_name.clone(),
                    kind: TransitionKind::Wake,
                    outcome,
                },
                now,
            )
            .await?;
        Ok(true)
    }

    /// One reap poll: rescue steps stuck in `running` past the threshold and
    /// purge expired idempotency keys. Returns the number of steps recovered.
    #[instrument(skip(self))]
    pub async fn reap_once(&self) -> Result<usize, WorkerError> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(self.config.stuck_step_timeout).unwrap_or_default();

        let stuck = self.store.find_stuck_steps(cutoff).await?;
        let mut recovered = 0;
        for step in stuck {
            if self.store.recover_step(step.id, now).await? {
                info!(
                    step = %step.step_name,
                    execution_id = %step.execution_id,
                    "recovered stuck step"
                );
                recovered += 1;
            }
        }

        let purged = self.store.purge_expired_idempotency_keys(now).await?;
        if purged > 0 {
            debug!(purged, "purged expired idempotency keys");
        }

        Ok(recovered)
    }
}
