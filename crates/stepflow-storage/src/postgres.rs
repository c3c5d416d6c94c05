//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence with:
//! - Claiming via `SELECT ... FOR UPDATE SKIP LOCKED` in a transaction held
//!   open for the batch lifetime (a crashed dispatcher releases its rows)
//! - Per-row step/execution/history writes in their own transactions, so a
//!   crash between the running-mark and the outcome leaves the step visible
//!   to the reaper
//! - Consumed queue rows deleted on the claim transaction, disappearing
//!   atomically at batch commit

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use stepflow_core::StateType;

use crate::models::*;
use crate::store::*;

/// PostgreSQL implementation of ExecutionStore
///
/// Uses a connection pool; any number of worker processes may share one
/// database.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, definition_json))]
    async fn register_workflow_version(
        &self,
        name: &str,
        description: Option<&str>,
        version: &str,
        definition_json: &Value,
    ) -> Result<VersionRecord, StoreError> {
        let mut tx = begin(&self.pool).await?;

        // Create-or-touch the workflow row so RETURNING yields the id either way
        let row = sqlx::query(
            r#"
            INSERT INTO workflows (id, name, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(description)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let workflow_id: Uuid = row.get("id");

        let version_row = sqlx::query(
            r#"
            INSERT INTO workflow_versions (id, workflow_id, version, definition_json)
            VALUES ($1, $2, $3, $4)
            RETURNING id, workflow_id, version, definition_json, is_active, created_at, updated_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(workflow_id)
        .bind(version)
        .bind(definition_json)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict(format!("version '{version}' of '{name}' already exists"))
            } else {
                db_err(e)
            }
        })?;

        let record = version_from_row(&version_row)?;
        commit(tx).await?;

        debug!(%name, %version, "registered workflow version");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn find_workflow(&self, name: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, description, created_at, updated_at
            FROM workflows WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| WorkflowRecord {
            id: row.get("id"),
            name: row.get("name"),
            description: row.get("description"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn find_version(
        &self,
        workflow_id: Uuid,
        version: &str,
    ) -> Result<Option<VersionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, definition_json, is_active, created_at, updated_at
            FROM workflow_versions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| version_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn latest_version(&self, workflow_id: Uuid) -> Result<Option<VersionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, definition_json, is_active, created_at, updated_at
            FROM workflow_versions
            WHERE workflow_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| version_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<VersionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_id, version, definition_json, is_active, created_at, updated_at
            FROM workflow_versions
            WHERE workflow_id = $1
            ORDER BY version DESC
            "#,
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(version_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_version(&self, version_id: Uuid) -> Result<VersionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, version, definition_json, is_active, created_at, updated_at
            FROM workflow_versions WHERE id = $1
            "#,
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("workflow version {version_id}")))?;

        version_from_row(&row)
    }

    #[instrument(skip(self, new), fields(execution_id = %new.execution_id))]
    async fn create_execution(
        &self,
        new: NewExecution,
        now: DateTime<Utc>,
    ) -> Result<ExecutionRecord, StoreError> {
        let mut tx = begin(&self.pool).await?;

        let execution_id = Uuid::now_v7();
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                id, workflow_version_id, execution_id, status, current_state,
                input_data, started_at
            )
            VALUES ($1, $2, $3, 'running', $4, $5, $6)
            RETURNING id, workflow_version_id, execution_id, status, current_state,
                      input_data, output_data, error_message, started_at, completed_at,
                      created_at, updated_at
            "#,
        )
        .bind(execution_id)
        .bind(new.workflow_version_id)
        .bind(&new.execution_id)
        .bind(&new.start_state)
        .bind(&new.input)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let record = execution_from_row(&row)?;

        let step_status = if new.run_after.is_some() {
            StepStatus::Waiting
        } else {
            StepStatus::Pending
        };
        insert_step(
            &mut tx,
            execution_id,
            &new.start_state,
            new.start_state_type,
            step_status,
            &new.input,
            new.run_after,
            new.timeout_seconds,
            &new.retry,
        )
        .await?;

        insert_queue_row(&mut tx, execution_id, new.run_after.unwrap_or(now), new.run_after)
            .await?;

        append_history(
            &mut tx,
            execution_id,
            None,
            HistoryEventType::ExecutionStarted,
            Some(json!({ "input": new.input })),
        )
        .await?;

        if let Some(entry) = &new.idempotency {
            // Claim the key unless a live record already holds it
            let claimed = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (id, key_hash, execution_id, expires_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (key_hash) DO UPDATE
                SET execution_id = EXCLUDED.execution_id,
                    expires_at = EXCLUDED.expires_at
                WHERE idempotency_keys.expires_at <= $5
                RETURNING id
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&entry.key_hash)
            .bind(execution_id)
            .bind(entry.expires_at)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            if claimed.is_none() {
                return Err(StoreError::Conflict(
                    "idempotency key already mapped to a live execution".to_string(),
                ));
            }
        }

        commit(tx).await?;
        debug!(execution = %new.execution_id, start_state = %new.start_state, "created execution");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, execution_id, status, current_state,
                   input_data, output_data, error_message, started_at, completed_at,
                   created_at, updated_at
            FROM workflow_executions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        execution_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_execution_by_public_id(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, execution_id, status, current_state,
                   input_data, output_data, error_message, started_at, completed_at,
                   created_at, updated_at
            FROM workflow_executions WHERE execution_id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| execution_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list_executions(
        &self,
        filter: ExecutionFilter,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_version_id, execution_id, status, current_state,
                   input_data, output_data, error_message, started_at, completed_at,
                   created_at, updated_at
            FROM workflow_executions
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR workflow_version_id = $2)
            ORDER BY started_at DESC
            OFFSET $3
            LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.workflow_version_id)
        .bind(filter.offset.unwrap_or(0))
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(execution_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn cancel_execution(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, StoreError> {
        let mut tx = begin(&self.pool).await?;

        // Serializes against the worker's outcome transaction
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, execution_id, status, current_state,
                   input_data, output_data, error_message, started_at, completed_at,
                   created_at, updated_at
            FROM workflow_executions WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        let mut record = execution_from_row(&row)?;

        if record.status != ExecutionStatus::Running {
            return Ok(CancelOutcome::NotRunning(record));
        }

        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'cancelled', completed_at = $2, updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Skip rows locked by an in-flight dispatcher: that worker discovers
        // the cancelled status at persistence time and consumes its own row
        sqlx::query(
            r#"
            DELETE FROM execution_queue
            WHERE id IN (
                SELECT id FROM execution_queue
                WHERE execution_id = $1
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        append_history(
            &mut tx,
            id,
            None,
            HistoryEventType::ExecutionCancelled,
            None,
        )
        .await?;

        commit(tx).await?;

        record.status = ExecutionStatus::Cancelled;
        record.completed_at = Some(now);
        debug!(execution = %record.execution_id, "cancelled execution");
        Ok(CancelOutcome::Cancelled(record))
    }

    #[instrument(skip(self))]
    async fn fail_execution(
        &self,
        id: Uuid,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = begin(&self.pool).await?;

        let updated = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'failed', error_message = $2, completed_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error_message)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            append_history(
                &mut tx,
                id,
                None,
                HistoryEventType::ExecutionFailed,
                Some(json!({ "errorMessage": error_message })),
            )
            .await?;
        }

        commit(tx).await
    }

    #[instrument(skip(self))]
    async fn get_step(&self, step_id: Uuid) -> Result<StepRecord, StoreError> {
        let row = sqlx::query(&step_select("WHERE id = $1"))
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("step {step_id}")))?;

        step_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_step(
        &self,
        execution_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        // Latest row wins: a Choice loop can revisit a state name
        let row = sqlx::query(&step_select(
            "WHERE execution_id = $1 AND step_name = $2 ORDER BY created_at DESC, id DESC LIMIT 1",
        ))
        .bind(execution_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|r| step_from_row(&r)).transpose()
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, execution_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(&step_select(
            "WHERE execution_id = $1 ORDER BY created_at ASC, id ASC",
        ))
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn start_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = begin(&self.pool).await?;

        let row = sqlx::query(
            r#"
            UPDATE execution_steps
            SET status = 'running', started_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING execution_id, step_name
            "#,
        )
        .bind(step_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::Conflict(format!("step {step_id} is not pending")))?;

        let execution_id: Uuid = row.get("execution_id");
        let step_name: String = row.get("step_name");

        append_history(
            &mut tx,
            execution_id,
            Some(&step_name),
            HistoryEventType::StepStarted,
            None,
        )
        .await?;

        commit(tx).await
    }

    #[instrument(skip(self, transition), fields(step = %transition.step_name))]
    async fn apply_transition(
        &self,
        transition: &StepTransition,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, StoreError> {
        let mut tx = begin(&self.pool).await?;

        // Serialize against CancelExecution
        let row = sqlx::query(
            r#"
            SELECT status FROM workflow_executions WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(transition.execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            StoreError::NotFound(format!("execution {}", transition.execution_id))
        })?;
        let status: String = row.get("status");

        if ExecutionStatus::parse(&status) != Some(ExecutionStatus::Running) {
            // Forensic history only; no state transitions for a terminal execution
            let event = match &transition.outcome {
                StepOutcome::FailStep { .. } => HistoryEventType::StepFailed,
                StepOutcome::ErrorStep { .. } => HistoryEventType::StepError,
                _ => HistoryEventType::StepCompleted,
            };
            append_history(
                &mut tx,
                transition.execution_id,
                Some(&transition.step_name),
                event,
                None,
            )
            .await?;
            commit(tx).await?;
            return Ok(TransitionResult::ExecutionNotRunning);
        }

        let expected_status = match transition.kind {
            TransitionKind::Dispatch => StepStatus::Running,
            TransitionKind::Wake => StepStatus::Waiting,
        };

        match &transition.outcome {
            StepOutcome::Advance { output, next } => {
                close_step(&mut tx, transition.step_id, expected_status, Some(output), now)
                    .await?;

                if transition.kind == TransitionKind::Wake {
                    // The wait step's time-gated queue row is consumed here
                    delete_queue_rows(&mut tx, transition.execution_id).await?;
                }

                let next_status = if next.run_after.is_some() {
                    StepStatus::Waiting
                } else {
                    StepStatus::Pending
                };
                insert_step(
                    &mut tx,
                    transition.execution_id,
                    &next.name,
                    next.step_type,
                    next_status,
                    &next.input,
                    next.run_after,
                    next.timeout_seconds,
                    &next.retry,
                )
                .await?;
                let scheduled_at = next.run_after.unwrap_or(now);
                insert_queue_row(&mut tx, transition.execution_id, scheduled_at, next.run_after)
                    .await?;

                sqlx::query(
                    r#"
                    UPDATE workflow_executions SET current_state = $2, updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(transition.execution_id)
                .bind(&next.name)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                let completed_event = match transition.kind {
                    TransitionKind::Dispatch => HistoryEventType::StepCompleted,
                    TransitionKind::Wake => HistoryEventType::WaitCompleted,
                };
                append_history(
                    &mut tx,
                    transition.execution_id,
                    Some(&transition.step_name),
                    completed_event,
                    Some(json!({ "output": output })),
                )
                .await?;
                append_history(
                    &mut tx,
                    transition.execution_id,
                    Some(&next.name),
                    HistoryEventType::NextStateQueued,
                    Some(json!({ "nextState": next.name, "scheduledAt": scheduled_at })),
                )
                .await?;
            }

            StepOutcome::CompleteExecution { output } => {
                close_step(&mut tx, transition.step_id, expected_status, Some(output), now)
                    .await?;
                if transition.kind == TransitionKind::Wake {
                    delete_queue_rows(&mut tx, transition.execution_id).await?;
                }

                sqlx::query(
                    r#"
                    UPDATE workflow_executions
                    SET status = 'completed', output_data = $2, completed_at = $3, updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(transition.execution_id)
                .bind(output)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

                append_history(
                    &mut tx,
                    transition.execution_id,
                    Some(&transition.step_name),
                    HistoryEventType::StepCompleted,
                    Some(json!({ "output": output })),
                )
                .await?;
                append_history(
                    &mut tx,
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionCompleted,
                    Some(json!({ "output": output })),
                )
                .await?;
            }

            StepOutcome::FailWorkflow { error_message } => {
                close_step(&mut tx, transition.step_id, expected_status, None, now).await?;
                if transition.kind == TransitionKind::Wake {
                    delete_queue_rows(&mut tx, transition.execution_id).await?;
                }
                fail_execution_in_tx(&mut tx, transition.execution_id, error_message, now).await?;

                append_history(
                    &mut tx,
                    transition.execution_id,
                    Some(&transition.step_name),
                    HistoryEventType::StepCompleted,
                    None,
                )
                .await?;
                append_history(
                    &mut tx,
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionFailed,
                    Some(json!({ "errorMessage": error_message })),
                )
                .await?;
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

                let updated = sqlx::query(
                    r#"
                    UPDATE execution_steps
                    SET status = 'failed', error_type = $2, error_message = $3,
                        completed_at = $4, updated_at = $4
                    WHERE id = $1 AND status = $5
                    "#,
                )
                .bind(transition.step_id)
                .bind(error_type)
                .bind(error_message)
                .bind(now)
                .bind(expected_status.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                if updated.rows_affected() == 0 {
                    return Err(StoreError::Conflict(format!(
                        "step {} is not {expected_status}",
                        transition.step_id
                    )));
                }

                if transition.kind == TransitionKind::Wake {
                    delete_queue_rows(&mut tx, transition.execution_id).await?;
                }
                fail_execution_in_tx(&mut tx, transition.execution_id, error_message, now).await?;

                append_history(
                    &mut tx,
                    transition.execution_id,
                    Some(&transition.step_name),
                    step_event,
                    Some(json!({ "errorType": error_type, "errorMessage": error_message })),
                )
                .await?;
                append_history(
                    &mut tx,
                    transition.execution_id,
                    None,
                    HistoryEventType::ExecutionFailed,
                    Some(json!({ "errorMessage": error_message })),
                )
                .await?;
            }
        }

        commit(tx).await?;
        Ok(TransitionResult::Applied)
    }

    #[instrument(skip(self))]
    async fn find_stuck_steps(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(&step_select(
            "WHERE status = 'running' AND started_at < $1 ORDER BY started_at ASC",
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn recover_step(&self, step_id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tx = begin(&self.pool).await?;

        // Guarded against the step or its execution having moved on
        let row = sqlx::query(
            r#"
            UPDATE execution_steps s
            SET status = 'pending', started_at = NULL, completed_at = NULL, updated_at = $2
            FROM workflow_executions e
            WHERE s.id = $1
              AND s.status = 'running'
              AND e.id = s.execution_id
              AND e.status = 'running'
            RETURNING s.execution_id, s.step_name
            "#,
        )
        .bind(step_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let execution_id: Uuid = row.get("execution_id");
        let step_name: String = row.get("step_name");

        insert_queue_row(&mut tx, execution_id, now, None).await?;
        append_history(
            &mut tx,
            execution_id,
            Some(&step_name),
            HistoryEventType::StepRecovered,
            None,
        )
        .await?;

        commit(tx).await?;
        debug!(%step_id, %step_name, "recovered stuck step");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn find_due_wait_steps(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(&step_select(
            "WHERE status = 'waiting' AND run_after_ts <= $1 ORDER BY run_after_ts ASC",
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn claim_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Box<dyn ClaimedBatch>, StoreError> {
        let mut tx = begin(&self.pool).await?;

        // The locks taken here are held until the batch commits or rolls
        // back; a crashed dispatcher releases its rows automatically
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM execution_queue
                WHERE status = 'queued'
                  AND scheduled_at <= $1
                  AND (run_after_ts IS NULL OR run_after_ts <= $1)
                ORDER BY priority DESC, scheduled_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE execution_queue q
            SET status = 'processing', updated_at = $1
            FROM claimable c
            WHERE q.id = c.id
            RETURNING q.id, q.execution_id, q.priority, q.scheduled_at, q.status,
                      q.retry_count, q.run_after_ts, q.created_at
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut items = rows
            .iter()
            .map(queue_item_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE ordering
        items.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.scheduled_at.cmp(&b.scheduled_at))
        });

        if !items.is_empty() {
            debug!(count = items.len(), "claimed queue rows");
        }

        Ok(Box::new(PgClaimedBatch {
            tx,
            items,
            deleted: Vec::new(),
        }))
    }

    #[instrument(skip(self))]
    async fn list_history(&self, execution_id: Uuid) -> Result<Vec<HistoryRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, step_name, event_type, event_data, created_at
            FROM execution_history
            WHERE execution_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(history_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn find_idempotency_key(
        &self,
        key_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT execution_id FROM idempotency_keys
            WHERE key_hash = $1 AND expires_at > $2
            "#,
        )
        .bind(key_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|r| r.get("execution_id")))
    }

    #[instrument(skip(self))]
    async fn purge_expired_idempotency_keys(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys WHERE expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

/// A claimed batch holding its transaction (and therefore its row locks) open.
struct PgClaimedBatch {
    tx: Transaction<'static, Postgres>,
    items: Vec<QueueItem>,
    deleted: Vec<Uuid>,
}

#[async_trait]
impl ClaimedBatch for PgClaimedBatch {
    fn items(&self) -> &[QueueItem] {
        &self.items
    }

    async fn delete_item(&mut self, item_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM execution_queue WHERE id = $1")
            .bind(item_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        self.deleted.push(item_id);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        // Rows left in place (the Wait safety-net branch) go back to queued
        let remaining: Vec<Uuid> = self
            .items
            .iter()
            .map(|item| item.id)
            .filter(|id| !self.deleted.contains(id))
            .collect();
        if !remaining.is_empty() {
            sqlx::query("UPDATE execution_queue SET status = 'queued' WHERE id = ANY($1)")
                .bind(&remaining)
                .execute(&mut *self.tx)
                .await
                .map_err(db_err)?;
        }
        self.tx.commit().await.map_err(db_err)
    }
}

// Shared statement fragments and row mappers

fn step_select(suffix: &str) -> String {
    format!(
        "SELECT id, execution_id, step_name, step_type, status, input_data, output_data, \
         error_type, error_message, retry_count, max_retries, backoff_multiplier, \
         initial_interval_ms, timeout_seconds, run_after_ts, started_at, completed_at, \
         created_at, updated_at FROM execution_steps {suffix}"
    )
}

async fn begin(pool: &PgPool) -> Result<Transaction<'static, Postgres>, StoreError> {
    pool.begin().await.map_err(db_err)
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), StoreError> {
    tx.commit().await.map_err(db_err)
}

fn db_err(e: sqlx::Error) -> StoreError {
    error!("database error: {}", e);
    StoreError::Database(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

#[allow(clippy::too_many_arguments)]
async fn insert_step(
    tx: &mut Transaction<'static, Postgres>,
    execution_id: Uuid,
    step_name: &str,
    step_type: StateType,
    status: StepStatus,
    input: &Value,
    run_after: Option<DateTime<Utc>>,
    timeout_seconds: Option<i64>,
    retry: &StepRetryParams,
) -> Result<Uuid, StoreError> {
    let step_id = Uuid::now_v7();
    sqlx::query(
        r#"
        INSERT INTO execution_steps (
            id, execution_id, step_name, step_type, status, input_data,
            max_retries, backoff_multiplier, initial_interval_ms,
            timeout_seconds, run_after_ts
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(step_id)
    .bind(execution_id)
    .bind(step_name)
    .bind(step_type.to_string())
    .bind(status.to_string())
    .bind(input)
    .bind(retry.max_retries)
    .bind(retry.backoff_multiplier)
    .bind(retry.initial_interval_ms)
    .bind(timeout_seconds)
    .bind(run_after)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(step_id)
}

async fn insert_queue_row(
    tx: &mut Transaction<'static, Postgres>,
    execution_id: Uuid,
    scheduled_at: DateTime<Utc>,
    run_after: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO execution_queue (id, execution_id, priority, scheduled_at, status, run_after_ts)
        VALUES ($1, $2, 0, $3, 'queued', $4)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(execution_id)
    .bind(scheduled_at)
    .bind(run_after)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    Ok(())
}

async fn delete_queue_rows(
    tx: &mut Transaction<'static, Postgres>,
    execution_id: Uuid,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM execution_queue WHERE execution_id = $1")
        .bind(execution_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn close_step(
    tx: &mut Transaction<'static, Postgres>,
    step_id: Uuid,
    expected: StepStatus,
    output: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let updated = sqlx::query(
        r#"
        UPDATE execution_steps
        SET status = 'completed', output_data = $2, completed_at = $3, updated_at = $3
        WHERE id = $1 AND status = $4
        "#,
    )
    .bind(step_id)
    .bind(output)
    .bind(now)
    .bind(expected.to_string())
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;

    if updated.rows_affected() == 0 {
        return Err(StoreError::Conflict(format!(
            "step {step_id} is not {expected}"
        )));
    }
    Ok(())
}

async fn fail_execution_in_tx(
    tx: &mut Transaction<'static, Postgres>,
    execution_id: Uuid,
    error_message: &str,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE workflow_executions
        SET status = 'failed', error_message = $2, completed_at = $3, updated_at = $3
        WHERE id = $1
        "#,
    )
    .bind(execution_id)
    .bind(error_message)
    .bind(now)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn append_history(
    tx: &mut Transaction<'static, Postgres>,
    execution_id: Uuid,
    step_name: Option<&str>,
    event_type: HistoryEventType,
    event_data: Option<Value>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO execution_history (execution_id, step_name, event_type, event_data)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(execution_id)
    .bind(step_name)
    .bind(event_type.as_str())
    .bind(event_data)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord, StoreError> {
    let status: String = row.get("status");
    Ok(ExecutionRecord {
        id: row.get("id"),
        workflow_version_id: row.get("workflow_version_id"),
        execution_id: row.get("execution_id"),
        status: ExecutionStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown execution status: {status}")))?,
        current_state: row.get("current_state"),
        input_data: row.get("input_data"),
        output_data: row.get("output_data"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn step_from_row(row: &PgRow) -> Result<StepRecord, StoreError> {
    let status: String = row.get("status");
    let step_type: String = row.get("step_type");
    Ok(StepRecord {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        step_type: StateType::parse(&step_type)
            .ok_or_else(|| StoreError::Database(format!("unknown step type: {step_type}")))?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown step status: {status}")))?,
        input_data: row.get("input_data"),
        output_data: row.get("output_data"),
        error_type: row.get("error_type"),
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        max_retries: row.get("max_retries"),
        backoff_multiplier: row.get("backoff_multiplier"),
        initial_interval_ms: row.get("initial_interval_ms"),
        timeout_seconds: row.get("timeout_seconds"),
        run_after_ts: row.get("run_after_ts"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn version_from_row(row: &PgRow) -> Result<VersionRecord, StoreError> {
    Ok(VersionRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        version: row.get("version"),
        definition_json: row.get("definition_json"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn queue_item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    let status: String = row.get("status");
    Ok(QueueItem {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        priority: row.get("priority"),
        scheduled_at: row.get("scheduled_at"),
        status: QueueStatus::parse(&status)
            .ok_or_else(|| StoreError::Database(format!("unknown queue status: {status}")))?,
        retry_count: row.get("retry_count"),
        run_after_ts: row.get("run_after_ts"),
        created_at: row.get("created_at"),
    })
}

fn history_from_row(row: &PgRow) -> Result<HistoryRecord, StoreError> {
    let event_type: String = row.get("event_type");
    Ok(HistoryRecord {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        step_name: row.get("step_name"),
        event_type: HistoryEventType::parse(&event_type)
            .ok_or_else(|| StoreError::Database(format!("unknown event type: {event_type}")))?,
        event_data: row.get("event_data"),
        timestamp: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    // Claim-protocol and transition semantics against a real database live in
    // tests/postgres_integration_test.rs (requires DATABASE_URL).
}
