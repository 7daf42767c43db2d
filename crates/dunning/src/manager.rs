//! Dunning manager
//!
//! Owns the lifecycle of a dunning process:
//!
//! - `start_dunning`: open a process for a failure, or append to the open one
//! - `execute_step`: run the current step and advance, recover or exhaust
//! - `recover_dunning` / `handle_payment_success`: payment came through
//! - `pause_dunning` / `resume_dunning`: reversible side-transitions
//! - `cancel_dunning`: manual termination
//!
//! The manager holds no per-customer state between calls and runs no timers.
//! An external scheduler calls `start_dunning` for new failures and
//! `execute_step` for the ids returned by `due_steps`. Every operation re-reads
//! persisted state, so redundant scheduler invocations are harmless no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::DunningConfig;
use crate::context::StepExecutionContext;
use crate::error::{DunningError, DunningResult};
use crate::events::{DunningEvent, DunningEventHandler, DunningEventPayload, EventBus};
use crate::executor::StepExecutor;
use crate::sequence::DunningSequence;
use crate::storage::DunningStorage;
use crate::types::{
    AccessLevel, CustomerSnapshot, DunningAction, DunningState, DunningStateUpdate, DunningStatus,
    EndReason, ExecutedStep, PaymentFailure, ScheduledStep,
};

/// Metadata key holding the free-text reason passed to `cancel_dunning`
pub const CANCEL_REASON_KEY: &str = "cancel_reason";

pub struct DunningManager {
    storage: Arc<dyn DunningStorage>,
    config: DunningConfig,
    executor: StepExecutor,
    events: EventBus,
}

impl DunningManager {
    /// Fails if the config references sequences missing from its catalog
    pub fn new(storage: Arc<dyn DunningStorage>, config: DunningConfig) -> DunningResult<Self> {
        config.validate()?;

        let events = EventBus::new();
        if let Some(sink) = config.event_sink.clone() {
            events.subscribe(sink);
        }

        Ok(Self {
            storage,
            executor: StepExecutor::new(config.callbacks.clone()),
            config,
            events,
        })
    }

    pub fn config(&self) -> &DunningConfig {
        &self.config
    }

    /// Register a closure for every lifecycle event
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&DunningEvent) -> DunningResult<()> + Send + Sync + 'static,
    {
        self.events.on_event(handler);
    }

    pub fn subscribe(&self, handler: Arc<dyn DunningEventHandler>) {
        self.events.subscribe(handler);
    }

    // ============ LIFECYCLE ============

    /// Open a dunning process for `failure`.
    ///
    /// A customer already in dunning gets the failure appended to their open
    /// process; step index and sequence are left alone.
    pub async fn start_dunning(&self, failure: PaymentFailure) -> DunningResult<DunningState> {
        if let Some(existing) = self.storage.get_dunning_state(&failure.customer_id).await? {
            self.storage.record_payment_failure(&failure).await?;

            let mut failures = existing.failures.clone();
            failures.push(failure.clone());
            let updated = self
                .storage
                .update_dunning_state(
                    existing.id,
                    &DunningStateUpdate {
                        failures: Some(failures),
                        ..Default::default()
                    },
                )
                .await?;

            tracing::info!(
                customer_id = %failure.customer_id,
                state_id = %updated.id,
                failure_count = updated.failures.len(),
                amount_owed_cents = updated.total_amount_owed_cents(),
                "Payment failed again during dunning, failure appended"
            );
            return Ok(updated);
        }

        let customer = self.resolve_customer(&failure.customer_id).await;
        let sequence = self.resolve_sequence(customer.tier.as_deref())?;
        let first_step = sequence.first_step().map_err(|e| {
            tracing::error!(
                sequence_id = %sequence.id,
                customer_id = %failure.customer_id,
                "Dunning sequence has no steps"
            );
            e
        })?;
        let next_step_at = first_step.scheduled_at(failure.failed_at)?;

        let state = DunningState {
            id: Uuid::new_v4(),
            customer_id: failure.customer_id.clone(),
            subscription_id: failure.subscription_id.clone(),
            sequence_id: sequence.id.clone(),
            current_step_index: 0,
            current_step_id: first_step.id.clone(),
            status: DunningStatus::Active,
            initial_failure: failure.clone(),
            failures: vec![failure.clone()],
            executed_steps: Vec::new(),
            // Step offsets are measured from the triggering failure
            started_at: failure.failed_at,
            last_step_at: None,
            next_step_at: Some(next_step_at),
            ended_at: None,
            end_reason: None,
            total_retry_attempts: 0,
            metadata: HashMap::new(),
        };

        self.storage.save_dunning_state(&state).await?;
        self.storage.record_payment_failure(&failure).await?;
        self.storage
            .schedule_step(state.id, &first_step.id, next_step_at)
            .await?;

        tracing::info!(
            customer_id = %state.customer_id,
            state_id = %state.id,
            sequence_id = %state.sequence_id,
            step_id = %first_step.id,
            next_step_at = %next_step_at,
            "Dunning started"
        );

        self.emit(
            &state,
            DunningEventPayload::Started {
                sequence_id: state.sequence_id.clone(),
                step_id: first_step.id.clone(),
                amount_cents: failure.amount_cents,
                currency: failure.currency.clone(),
                next_step_at: Some(next_step_at),
            },
        )
        .await;

        Ok(state)
    }

    /// Run the current step of an active process.
    ///
    /// Returns `None` when the state is missing or not active, and when the
    /// step was skipped by its condition.
    pub async fn execute_step(&self, state_id: Uuid) -> DunningResult<Option<ExecutedStep>> {
        let Some(state) = self.storage.get_dunning_state_by_id(state_id).await? else {
            tracing::debug!(state_id = %state_id, "execute_step: state not found, ignoring");
            return Ok(None);
        };
        if state.status != DunningStatus::Active {
            tracing::debug!(
                state_id = %state_id,
                status = %state.status,
                "execute_step: state not active, ignoring"
            );
            return Ok(None);
        }

        let sequence = self.sequence(&state.sequence_id)?;
        let Some(step) = sequence.step(state.current_step_index) else {
            tracing::warn!(
                state_id = %state_id,
                step_index = state.current_step_index,
                "Current step index is past the end of the sequence"
            );
            self.exhaust_dunning(state).await?;
            return Ok(None);
        };

        let now = self.config.now();
        let customer = self.resolve_customer(&state.customer_id).await;
        let context = StepExecutionContext::build(&state, step, customer, &self.config.urls, now);

        if let Some(condition) = &step.condition {
            if !condition.evaluate(&context) {
                tracing::info!(
                    state_id = %state_id,
                    step_id = %step.id,
                    condition = %condition.name(),
                    "Dunning step condition not met, skipping"
                );
                self.advance_to_next_step(state).await?;
                return Ok(None);
            }
        }

        let executed = self.executor.execute(step, &context).await;

        let mut executed_steps = state.executed_steps.clone();
        executed_steps.push(executed.clone());
        let total_retry_attempts = state.total_retry_attempts + u32::from(executed.payment_retried);

        let state = self
            .storage
            .update_dunning_state(
                state_id,
                &DunningStateUpdate {
                    executed_steps: Some(executed_steps),
                    last_step_at: Some(now),
                    total_retry_attempts: Some(total_retry_attempts),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            state_id = %state_id,
            customer_id = %state.customer_id,
            step_id = %step.id,
            actions = ?executed.actions_executed,
            payment_succeeded = ?executed.payment_succeeded,
            error = ?executed.error,
            "Dunning step executed"
        );

        self.emit_step_events(&state, &executed).await;

        if executed.payment_recovered() {
            self.complete_recovery(state, EndReason::PaymentRecovered, executed.transaction_id.clone())
                .await?;
        } else if step.is_final {
            self.exhaust_dunning(state).await?;
        } else {
            self.advance_to_next_step(state).await?;
        }

        Ok(Some(executed))
    }

    /// Mark a process recovered and restore full access
    pub async fn recover_dunning(&self, state_id: Uuid, reason: EndReason) -> DunningResult<DunningState> {
        let state = self.require_state(state_id).await?;
        self.complete_recovery(state, reason, None).await
    }

    /// Recover the customer's open process after a payment that happened
    /// outside dunning. `None` when the customer is not in dunning.
    pub async fn handle_payment_success(&self, customer_id: &str) -> DunningResult<Option<DunningState>> {
        match self.storage.get_dunning_state(customer_id).await? {
            Some(state) => Ok(Some(
                self.complete_recovery(state, EndReason::PaymentUpdated, None)
                    .await?,
            )),
            None => {
                tracing::debug!(customer_id = %customer_id, "Payment succeeded for customer not in dunning");
                Ok(None)
            }
        }
    }

    /// Flip an active process to paused. Nothing else changes.
    pub async fn pause_dunning(&self, state_id: Uuid) -> DunningResult<Option<DunningState>> {
        let Some(state) = self.storage.get_dunning_state_by_id(state_id).await? else {
            return Ok(None);
        };
        if state.status != DunningStatus::Active {
            tracing::debug!(state_id = %state_id, status = %state.status, "pause_dunning: not active, ignoring");
            return Ok(None);
        }

        let state = self
            .storage
            .update_dunning_state(
                state_id,
                &DunningStateUpdate {
                    status: Some(DunningStatus::Paused),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            state_id = %state_id,
            customer_id = %state.customer_id,
            step_index = state.current_step_index,
            "Dunning paused"
        );
        self.emit(
            &state,
            DunningEventPayload::Paused {
                step_index: state.current_step_index,
            },
        )
        .await;

        Ok(Some(state))
    }

    /// Reactivate a paused process.
    ///
    /// The current step is rescheduled relative to now, not to the first
    /// failure. Resuming anything but a paused state is a no-op.
    pub async fn resume_dunning(&self, state_id: Uuid) -> DunningResult<Option<DunningState>> {
        let Some(state) = self.storage.get_dunning_state_by_id(state_id).await? else {
            return Ok(None);
        };
        if state.status != DunningStatus::Paused {
            tracing::debug!(state_id = %state_id, status = %state.status, "resume_dunning: not paused, ignoring");
            return Ok(None);
        }

        let sequence = self.sequence(&state.sequence_id)?;
        let step = sequence
            .step(state.current_step_index)
            .ok_or_else(|| {
                DunningError::InvalidConfig(format!(
                    "Sequence '{}' has no step at index {}",
                    sequence.id, state.current_step_index
                ))
            })?;
        let next_step_at = step.scheduled_at(self.config.now())?;

        let state = self
            .storage
            .update_dunning_state(
                state_id,
                &DunningStateUpdate {
                    status: Some(DunningStatus::Active),
                    next_step_at: Some(Some(next_step_at)),
                    ..Default::default()
                },
            )
            .await?;
        self.storage
            .schedule_step(state_id, &step.id, next_step_at)
            .await?;

        tracing::info!(
            state_id = %state_id,
            customer_id = %state.customer_id,
            step_id = %step.id,
            next_step_at = %next_step_at,
            "Dunning resumed"
        );
        self.emit(
            &state,
            DunningEventPayload::Resumed {
                step_id: step.id.clone(),
                next_step_at: Some(next_step_at),
            },
        )
        .await;

        Ok(Some(state))
    }

    /// Manually end a process at any step
    pub async fn cancel_dunning(&self, state_id: Uuid, reason: Option<&str>) -> DunningResult<DunningState> {
        let state = self.require_state(state_id).await?;
        if state.is_terminal() {
            tracing::debug!(state_id = %state_id, status = %state.status, "cancel_dunning: already ended");
            return Ok(state);
        }

        let mut metadata = state.metadata.clone();
        if let Some(reason) = reason {
            metadata.insert(CANCEL_REASON_KEY.to_string(), reason.to_string());
        }

        let state = self
            .storage
            .update_dunning_state(
                state_id,
                &DunningStateUpdate {
                    status: Some(DunningStatus::Canceled),
                    ended_at: Some(self.config.now()),
                    end_reason: Some(EndReason::ManuallyCanceled),
                    next_step_at: Some(None),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            state_id = %state_id,
            customer_id = %state.customer_id,
            reason = ?reason,
            "Dunning canceled"
        );
        self.emit(
            &state,
            DunningEventPayload::Canceled {
                reason: reason.map(str::to_string),
                step_index: state.current_step_index,
            },
        )
        .await;

        Ok(state)
    }

    // ============ INTERNAL TRANSITIONS ============

    async fn complete_recovery(
        &self,
        state: DunningState,
        reason: EndReason,
        transaction_id: Option<String>,
    ) -> DunningResult<DunningState> {
        if state.is_terminal() {
            tracing::debug!(state_id = %state.id, status = %state.status, "Recovery on ended dunning ignored");
            return Ok(state);
        }

        let state = self
            .storage
            .update_dunning_state(
                state.id,
                &DunningStateUpdate {
                    status: Some(DunningStatus::Recovered),
                    ended_at: Some(self.config.now()),
                    end_reason: Some(reason),
                    next_step_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        if let Some(controller) = &self.config.callbacks.access_controller {
            if let Err(e) = controller
                .update_access(&state.customer_id, AccessLevel::Full)
                .await
            {
                tracing::error!(
                    customer_id = %state.customer_id,
                    state_id = %state.id,
                    error = %e,
                    "Failed to restore full access after recovery"
                );
            }
        }

        tracing::info!(
            state_id = %state.id,
            customer_id = %state.customer_id,
            reason = %reason,
            total_retry_attempts = state.total_retry_attempts,
            "Dunning recovered"
        );
        self.emit(
            &state,
            DunningEventPayload::PaymentRecovered {
                reason,
                amount_recovered_cents: state.total_amount_owed_cents(),
                transaction_id,
                total_retry_attempts: state.total_retry_attempts,
                steps_executed: state.executed_steps.len(),
            },
        )
        .await;

        Ok(state)
    }

    async fn exhaust_dunning(&self, state: DunningState) -> DunningResult<DunningState> {
        if state.is_terminal() {
            return Ok(state);
        }

        let state = self
            .storage
            .update_dunning_state(
                state.id,
                &DunningStateUpdate {
                    status: Some(DunningStatus::Exhausted),
                    ended_at: Some(self.config.now()),
                    end_reason: Some(EndReason::MaxRetries),
                    next_step_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        tracing::warn!(
            state_id = %state.id,
            customer_id = %state.customer_id,
            total_retry_attempts = state.total_retry_attempts,
            steps_executed = state.executed_steps.len(),
            "Dunning exhausted"
        );
        self.emit(
            &state,
            DunningEventPayload::Exhausted {
                total_retry_attempts: state.total_retry_attempts,
                steps_executed: state.executed_steps.len(),
            },
        )
        .await;

        Ok(state)
    }

    /// Move to the next step and schedule it, or exhaust when there is none
    pub(crate) async fn advance_to_next_step(&self, state: DunningState) -> DunningResult<DunningState> {
        let sequence = self.sequence(&state.sequence_id)?;
        let next_index = state.current_step_index + 1;

        let Some(next_step) = sequence.step(next_index) else {
            return self.exhaust_dunning(state).await;
        };
        let next_step_at = next_step.scheduled_at(state.started_at)?;

        let state = self
            .storage
            .update_dunning_state(
                state.id,
                &DunningStateUpdate {
                    current_step_index: Some(next_index),
                    current_step_id: Some(next_step.id.clone()),
                    next_step_at: Some(Some(next_step_at)),
                    ..Default::default()
                },
            )
            .await?;
        self.storage
            .schedule_step(state.id, &next_step.id, next_step_at)
            .await?;

        tracing::debug!(
            state_id = %state.id,
            step_id = %next_step.id,
            next_step_at = %next_step_at,
            "Dunning advanced to next step"
        );
        Ok(state)
    }

    async fn emit_step_events(&self, state: &DunningState, executed: &ExecutedStep) {
        self.emit(
            state,
            DunningEventPayload::StepExecuted {
                step_id: executed.step_id.clone(),
                step_index: executed.step_index,
                actions: executed.actions_executed.clone(),
                error: executed.error.clone(),
            },
        )
        .await;

        if executed.payment_retried {
            self.emit(
                state,
                DunningEventPayload::PaymentRetried {
                    step_id: executed.step_id.clone(),
                    success: executed.payment_recovered(),
                    transaction_id: executed.transaction_id.clone(),
                    attempt: state.total_retry_attempts,
                },
            )
            .await;
        }

        if executed.succeeded(DunningAction::LimitFeatures) {
            self.emit(
                state,
                DunningEventPayload::AccessLimited {
                    step_id: executed.step_id.clone(),
                    access_level: executed.access_level_applied.unwrap_or(AccessLevel::Limited),
                },
            )
            .await;
        }
        if executed.succeeded(DunningAction::Suspend) {
            self.emit(
                state,
                DunningEventPayload::Suspended {
                    step_id: executed.step_id.clone(),
                    access_level: AccessLevel::ReadOnly,
                },
            )
            .await;
        }
    }

    async fn emit(&self, state: &DunningState, payload: DunningEventPayload) {
        let event = DunningEvent::new(state, payload, self.config.now());
        self.events.emit(&event).await;
    }

    // ============ LOOKUPS ============

    fn sequence(&self, sequence_id: &str) -> DunningResult<Arc<DunningSequence>> {
        self.config
            .sequences
            .get(sequence_id)
            .ok_or_else(|| DunningError::UnknownSequence(sequence_id.to_string()))
    }

    fn resolve_sequence(&self, tier: Option<&str>) -> DunningResult<Arc<DunningSequence>> {
        self.sequence(self.config.sequence_id_for_tier(tier))
    }

    /// Directory lookup, degrading to a bare snapshot when the directory is
    /// missing, has no record, or fails
    async fn resolve_customer(&self, customer_id: &str) -> CustomerSnapshot {
        let Some(directory) = &self.config.callbacks.customer_directory else {
            return CustomerSnapshot::bare(customer_id);
        };
        match directory.get_customer(customer_id).await {
            Ok(Some(customer)) => customer,
            Ok(None) => CustomerSnapshot::bare(customer_id),
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Customer lookup failed, using bare snapshot"
                );
                CustomerSnapshot::bare(customer_id)
            }
        }
    }

    async fn require_state(&self, state_id: Uuid) -> DunningResult<DunningState> {
        self.storage
            .get_dunning_state_by_id(state_id)
            .await?
            .ok_or_else(|| DunningError::StateNotFound(state_id.to_string()))
    }

    // ============ QUERIES ============

    /// The customer's in-flight process
    pub async fn get_state_for_customer(&self, customer_id: &str) -> DunningResult<Option<DunningState>> {
        self.storage.get_dunning_state(customer_id).await
    }

    pub async fn get_state(&self, state_id: Uuid) -> DunningResult<Option<DunningState>> {
        self.storage.get_dunning_state_by_id(state_id).await
    }

    pub async fn list_active_states(&self) -> DunningResult<Vec<DunningState>> {
        self.storage.get_active_dunning_states().await
    }

    pub async fn list_states_by_status(&self, status: DunningStatus) -> DunningResult<Vec<DunningState>> {
        self.storage.get_dunning_states_by_status(status).await
    }

    /// Steps due at or before `before`, for the external scheduler
    pub async fn due_steps(&self, before: OffsetDateTime) -> DunningResult<Vec<ScheduledStep>> {
        self.storage.get_scheduled_steps(before).await
    }

    /// Take exclusive ownership of a due step. `false` means another worker
    /// already has it.
    pub async fn claim_due_step(&self, step: &ScheduledStep) -> DunningResult<bool> {
        self.storage.claim_scheduled_step(step).await
    }
}
