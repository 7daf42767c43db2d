//! Dunning persistence
//!
//! The manager keeps no state between calls; everything lives behind
//! `DunningStorage`. Backends are expected to enforce two things the core
//! relies on but cannot check itself:
//!
//! 1. At most one in-flight (active or paused) state per customer.
//! 2. At most one execution per scheduled step when several scheduler workers
//!    run concurrently. `claim_scheduled_step` is the hook for that.

mod memory;
mod postgres;

pub use memory::InMemoryDunningStorage;
pub use postgres::PgDunningStorage;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DunningResult;
use crate::types::{DunningState, DunningStateUpdate, DunningStatus, PaymentFailure, ScheduledStep};

#[async_trait]
pub trait DunningStorage: Send + Sync {
    /// The customer's in-flight (active or paused) state, if any
    async fn get_dunning_state(&self, customer_id: &str) -> DunningResult<Option<DunningState>>;

    async fn get_dunning_state_by_id(&self, id: Uuid) -> DunningResult<Option<DunningState>>;

    async fn get_active_dunning_states(&self) -> DunningResult<Vec<DunningState>>;

    async fn get_dunning_states_by_status(
        &self,
        status: DunningStatus,
    ) -> DunningResult<Vec<DunningState>>;

    /// Insert a new state. Fails if the customer already has an in-flight state.
    async fn save_dunning_state(&self, state: &DunningState) -> DunningResult<()>;

    /// Apply a partial update and return the stored result
    async fn update_dunning_state(
        &self,
        id: Uuid,
        update: &DunningStateUpdate,
    ) -> DunningResult<DunningState>;

    async fn record_payment_failure(&self, failure: &PaymentFailure) -> DunningResult<()>;

    /// Schedule `step_id` for `state_id`, replacing any pending entry for that state
    async fn schedule_step(
        &self,
        state_id: Uuid,
        step_id: &str,
        at: OffsetDateTime,
    ) -> DunningResult<()>;

    /// Unclaimed steps of active states scheduled at or before `before`, oldest first
    async fn get_scheduled_steps(&self, before: OffsetDateTime) -> DunningResult<Vec<ScheduledStep>>;

    /// Take exclusive ownership of a due step. Returns false when another
    /// worker already claimed it. Backends without a lock primitive may keep
    /// the default, which always succeeds.
    async fn claim_scheduled_step(&self, _step: &ScheduledStep) -> DunningResult<bool> {
        Ok(true)
    }
}
