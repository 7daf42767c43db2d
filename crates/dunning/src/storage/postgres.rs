//! Postgres storage backend
//!
//! States keep their failure list, audit trail and metadata in JSONB columns.
//! The partial unique index on `customer_id` enforces one in-flight process per
//! customer; `claimed_at` on the scheduled steps table gives at-most-once
//! execution across scheduler workers.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::DunningStorage;
use crate::error::{DunningError, DunningResult};
use crate::types::{
    DunningState, DunningStateUpdate, DunningStatus, EndReason, ExecutedStep, PaymentFailure,
    ScheduledStep,
};

/// Claims older than this are considered abandoned by a crashed worker
const CLAIM_TIMEOUT_MINUTES: i32 = 30;

const STATE_COLUMNS: &str = r#"
    id, customer_id, subscription_id, sequence_id, current_step_index, current_step_id,
    status, initial_failure, failures, executed_steps, started_at, last_step_at,
    next_step_at, ended_at, end_reason, total_retry_attempts, metadata
"#;

#[derive(Debug, sqlx::FromRow)]
struct DunningStateRow {
    id: Uuid,
    customer_id: String,
    subscription_id: String,
    sequence_id: String,
    current_step_index: i32,
    current_step_id: String,
    status: String,
    initial_failure: Json<PaymentFailure>,
    failures: Json<Vec<PaymentFailure>>,
    executed_steps: Json<Vec<ExecutedStep>>,
    started_at: OffsetDateTime,
    last_step_at: Option<OffsetDateTime>,
    next_step_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    end_reason: Option<String>,
    total_retry_attempts: i32,
    metadata: Json<HashMap<String, String>>,
}

impl TryFrom<DunningStateRow> for DunningState {
    type Error = DunningError;

    fn try_from(row: DunningStateRow) -> Result<Self, Self::Error> {
        Ok(DunningState {
            id: row.id,
            customer_id: row.customer_id,
            subscription_id: row.subscription_id,
            sequence_id: row.sequence_id,
            current_step_index: usize::try_from(row.current_step_index).map_err(|_| {
                DunningError::Storage(format!(
                    "Negative step index {} on state {}",
                    row.current_step_index, row.id
                ))
            })?,
            current_step_id: row.current_step_id,
            status: row.status.parse()?,
            initial_failure: row.initial_failure.0,
            failures: row.failures.0,
            executed_steps: row.executed_steps.0,
            started_at: row.started_at,
            last_step_at: row.last_step_at,
            next_step_at: row.next_step_at,
            ended_at: row.ended_at,
            end_reason: row
                .end_reason
                .as_deref()
                .map(str::parse::<EndReason>)
                .transpose()?,
            total_retry_attempts: u32::try_from(row.total_retry_attempts).map_err(|_| {
                DunningError::Storage(format!(
                    "Negative retry count {} on state {}",
                    row.total_retry_attempts, row.id
                ))
            })?,
            metadata: row.metadata.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduledStepRow {
    state_id: Uuid,
    step_id: String,
    scheduled_at: OffsetDateTime,
}

impl From<ScheduledStepRow> for ScheduledStep {
    fn from(row: ScheduledStepRow) -> Self {
        ScheduledStep {
            state_id: row.state_id,
            step_id: row.step_id,
            scheduled_at: row.scheduled_at,
        }
    }
}

pub struct PgDunningStorage {
    pool: PgPool,
}

impl PgDunningStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded dunning migrations
    pub async fn migrate(&self) -> DunningResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Dunning migrations applied");
        Ok(())
    }

    async fn fetch_states(&self, filter: &str, bind: &str) -> DunningResult<Vec<DunningState>> {
        let rows: Vec<DunningStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM dunning_states WHERE {} ORDER BY started_at ASC",
            STATE_COLUMNS, filter
        ))
        .bind(bind)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        rows.into_iter().map(DunningState::try_from).collect()
    }
}

fn step_index_to_i32(index: usize) -> DunningResult<i32> {
    i32::try_from(index)
        .map_err(|_| DunningError::InvalidInput(format!("Step index {} out of range", index)))
}

#[async_trait]
impl DunningStorage for PgDunningStorage {
    async fn get_dunning_state(&self, customer_id: &str) -> DunningResult<Option<DunningState>> {
        let row: Option<DunningStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM dunning_states WHERE customer_id = $1 AND status IN ('active', 'paused') LIMIT 1",
            STATE_COLUMNS
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        row.map(DunningState::try_from).transpose()
    }

    async fn get_dunning_state_by_id(&self, id: Uuid) -> DunningResult<Option<DunningState>> {
        let row: Option<DunningStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM dunning_states WHERE id = $1",
            STATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        row.map(DunningState::try_from).transpose()
    }

    async fn get_active_dunning_states(&self) -> DunningResult<Vec<DunningState>> {
        self.get_dunning_states_by_status(DunningStatus::Active).await
    }

    async fn get_dunning_states_by_status(
        &self,
        status: DunningStatus,
    ) -> DunningResult<Vec<DunningState>> {
        self.fetch_states("status = $1", status.as_str()).await
    }

    async fn save_dunning_state(&self, state: &DunningState) -> DunningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_states (
                id, customer_id, subscription_id, sequence_id, current_step_index,
                current_step_id, status, initial_failure, failures, executed_steps,
                started_at, last_step_at, next_step_at, ended_at, end_reason,
                total_retry_attempts, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(state.id)
        .bind(&state.customer_id)
        .bind(&state.subscription_id)
        .bind(&state.sequence_id)
        .bind(step_index_to_i32(state.current_step_index)?)
        .bind(&state.current_step_id)
        .bind(state.status.as_str())
        .bind(Json(&state.initial_failure))
        .bind(Json(&state.failures))
        .bind(Json(&state.executed_steps))
        .bind(state.started_at)
        .bind(state.last_step_at)
        .bind(state.next_step_at)
        .bind(state.ended_at)
        .bind(state.end_reason.map(|r| r.as_str()))
        .bind(i32::try_from(state.total_retry_attempts).unwrap_or(i32::MAX))
        .bind(Json(&state.metadata))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                customer_id = %state.customer_id,
                state_id = %state.id,
                error = %e,
                "Failed to insert dunning state"
            );
            DunningError::Database(e.to_string())
        })?;

        Ok(())
    }

    async fn update_dunning_state(
        &self,
        id: Uuid,
        update: &DunningStateUpdate,
    ) -> DunningResult<DunningState> {
        let mut tx = self.pool.begin().await?;

        let row: Option<DunningStateRow> = sqlx::query_as(&format!(
            "SELECT {} FROM dunning_states WHERE id = $1 FOR UPDATE",
            STATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let mut state = row
            .map(DunningState::try_from)
            .transpose()?
            .ok_or_else(|| DunningError::StateNotFound(id.to_string()))?;
        update.apply_to(&mut state);

        sqlx::query(
            r#"
            UPDATE dunning_states
            SET current_step_index = $2,
                current_step_id = $3,
                status = $4,
                failures = $5,
                executed_steps = $6,
                last_step_at = $7,
                next_step_at = $8,
                ended_at = $9,
                end_reason = $10,
                total_retry_attempts = $11,
                metadata = $12,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(step_index_to_i32(state.current_step_index)?)
        .bind(&state.current_step_id)
        .bind(state.status.as_str())
        .bind(Json(&state.failures))
        .bind(Json(&state.executed_steps))
        .bind(state.last_step_at)
        .bind(state.next_step_at)
        .bind(state.ended_at)
        .bind(state.end_reason.map(|r| r.as_str()))
        .bind(i32::try_from(state.total_retry_attempts).unwrap_or(i32::MAX))
        .bind(Json(&state.metadata))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(state)
    }

    async fn record_payment_failure(&self, failure: &PaymentFailure) -> DunningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_payment_failures (
                id, customer_id, subscription_id, invoice_id, amount_cents, currency,
                failed_at, category, error_code, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(failure.id)
        .bind(&failure.customer_id)
        .bind(&failure.subscription_id)
        .bind(&failure.invoice_id)
        .bind(failure.amount_cents)
        .bind(&failure.currency)
        .bind(failure.failed_at)
        .bind(failure.category.as_str())
        .bind(&failure.error_code)
        .bind(&failure.error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        Ok(())
    }

    async fn schedule_step(
        &self,
        state_id: Uuid,
        step_id: &str,
        at: OffsetDateTime,
    ) -> DunningResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dunning_scheduled_steps (state_id, step_id, scheduled_at, claimed_at)
            VALUES ($1, $2, $3, NULL)
            ON CONFLICT (state_id) DO UPDATE SET
                step_id = EXCLUDED.step_id,
                scheduled_at = EXCLUDED.scheduled_at,
                claimed_at = NULL
            "#,
        )
        .bind(state_id)
        .bind(step_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_scheduled_steps(&self, before: OffsetDateTime) -> DunningResult<Vec<ScheduledStep>> {
        let rows: Vec<ScheduledStepRow> = sqlx::query_as(
            r#"
            SELECT s.state_id, s.step_id, s.scheduled_at
            FROM dunning_scheduled_steps s
            JOIN dunning_states d ON d.id = s.state_id
            WHERE d.status = 'active'
              AND s.scheduled_at <= $1
              AND (s.claimed_at IS NULL
                   OR s.claimed_at < NOW() - ($2 || ' minutes')::INTERVAL)
            ORDER BY s.scheduled_at ASC
            "#,
        )
        .bind(before)
        .bind(CLAIM_TIMEOUT_MINUTES.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        Ok(rows.into_iter().map(ScheduledStep::from).collect())
    }

    /// Conditional update: only one worker sees a returned row. Claims stuck
    /// for longer than the timeout can be taken over.
    async fn claim_scheduled_step(&self, step: &ScheduledStep) -> DunningResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE dunning_scheduled_steps
            SET claimed_at = NOW()
            WHERE state_id = $1
              AND step_id = $2
              AND scheduled_at = $3
              AND (claimed_at IS NULL
                   OR claimed_at < NOW() - ($4 || ' minutes')::INTERVAL)
            RETURNING state_id
            "#,
        )
        .bind(step.state_id)
        .bind(&step.step_id)
        .bind(step.scheduled_at)
        .bind(CLAIM_TIMEOUT_MINUTES.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DunningError::Database(e.to_string()))?;

        if claimed.is_none() {
            tracing::info!(
                state_id = %step.state_id,
                step_id = %step.step_id,
                "Scheduled step already claimed by another worker"
            );
        }

        Ok(claimed.is_some())
    }
}
