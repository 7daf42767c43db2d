//! In-memory storage backend, used for tests and single-process deployments

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::DunningStorage;
use crate::error::{DunningError, DunningResult};
use crate::types::{DunningState, DunningStateUpdate, DunningStatus, PaymentFailure, ScheduledStep};

#[derive(Default)]
pub struct InMemoryDunningStorage {
    states: RwLock<HashMap<Uuid, DunningState>>,
    failures: RwLock<Vec<PaymentFailure>>,
    /// One pending entry per state
    scheduled: RwLock<HashMap<Uuid, ScheduledStep>>,
    claimed: RwLock<HashSet<(Uuid, String, OffsetDateTime)>>,
}

impl InMemoryDunningStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every failure ever recorded, in insertion order
    pub async fn recorded_failures(&self) -> Vec<PaymentFailure> {
        self.failures.read().await.clone()
    }

    /// The pending scheduled entry for a state, claimed or not
    pub async fn scheduled_step_for(&self, state_id: Uuid) -> Option<ScheduledStep> {
        self.scheduled.read().await.get(&state_id).cloned()
    }

    pub async fn state_count(&self) -> usize {
        self.states.read().await.len()
    }

    #[cfg(test)]
    pub async fn claim_count(&self) -> usize {
        self.claimed.read().await.len()
    }
}

#[async_trait]
impl DunningStorage for InMemoryDunningStorage {
    async fn get_dunning_state(&self, customer_id: &str) -> DunningResult<Option<DunningState>> {
        let states = self.states.read().await;
        Ok(states
            .values()
            .find(|s| s.customer_id == customer_id && s.status.is_in_flight())
            .cloned())
    }

    async fn get_dunning_state_by_id(&self, id: Uuid) -> DunningResult<Option<DunningState>> {
        Ok(self.states.read().await.get(&id).cloned())
    }

    async fn get_active_dunning_states(&self) -> DunningResult<Vec<DunningState>> {
        self.get_dunning_states_by_status(DunningStatus::Active).await
    }

    async fn get_dunning_states_by_status(
        &self,
        status: DunningStatus,
    ) -> DunningResult<Vec<DunningState>> {
        let states = self.states.read().await;
        let mut matching: Vec<DunningState> = states
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.started_at);
        Ok(matching)
    }

    async fn save_dunning_state(&self, state: &DunningState) -> DunningResult<()> {
        let mut states = self.states.write().await;
        let duplicate = states.values().any(|s| {
            s.id != state.id && s.customer_id == state.customer_id && s.status.is_in_flight()
        });
        if duplicate && state.status.is_in_flight() {
            return Err(DunningError::Storage(format!(
                "Customer {} already has an in-flight dunning state",
                state.customer_id
            )));
        }
        states.insert(state.id, state.clone());
        Ok(())
    }

    async fn update_dunning_state(
        &self,
        id: Uuid,
        update: &DunningStateUpdate,
    ) -> DunningResult<DunningState> {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(&id)
            .ok_or_else(|| DunningError::StateNotFound(id.to_string()))?;
        update.apply_to(state);
        let updated = state.clone();

        if updated.is_terminal() {
            self.scheduled.write().await.remove(&id);
            self.claimed.write().await.retain(|(state_id, _, _)| *state_id != id);
        }
        Ok(updated)
    }

    async fn record_payment_failure(&self, failure: &PaymentFailure) -> DunningResult<()> {
        self.failures.write().await.push(failure.clone());
        Ok(())
    }

    async fn schedule_step(
        &self,
        state_id: Uuid,
        step_id: &str,
        at: OffsetDateTime,
    ) -> DunningResult<()> {
        self.scheduled.write().await.insert(
            state_id,
            ScheduledStep {
                state_id,
                step_id: step_id.to_string(),
                scheduled_at: at,
            },
        );
        Ok(())
    }

    async fn get_scheduled_steps(&self, before: OffsetDateTime) -> DunningResult<Vec<ScheduledStep>> {
        let states = self.states.read().await;
        let scheduled = self.scheduled.read().await;
        let claimed = self.claimed.read().await;

        let mut due: Vec<ScheduledStep> = scheduled
            .values()
            .filter(|s| s.scheduled_at <= before)
            .filter(|s| {
                states
                    .get(&s.state_id)
                    .is_some_and(|state| state.status == DunningStatus::Active)
            })
            .filter(|s| !claimed.contains(&(s.state_id, s.step_id.clone(), s.scheduled_at)))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.scheduled_at);
        Ok(due)
    }

    async fn claim_scheduled_step(&self, step: &ScheduledStep) -> DunningResult<bool> {
        let mut claimed = self.claimed.write().await;
        Ok(claimed.insert((step.state_id, step.step_id.clone(), step.scheduled_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use time::macros::datetime;

    fn state(customer_id: &str, status: DunningStatus) -> DunningState {
        let failure = PaymentFailure::new(
            customer_id,
            "sub_1",
            1_000,
            "usd",
            datetime!(2024-06-01 12:00 UTC),
        );
        DunningState {
            id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            subscription_id: "sub_1".to_string(),
            sequence_id: "standard_saas".to_string(),
            current_step_index: 0,
            current_step_id: "payment_failed".to_string(),
            status,
            initial_failure: failure.clone(),
            failures: vec![failure],
            executed_steps: vec![],
            started_at: datetime!(2024-06-01 12:00 UTC),
            last_step_at: None,
            next_step_at: None,
            ended_at: None,
            end_reason: None,
            total_retry_attempts: 0,
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_rejects_second_in_flight_state_for_customer() {
        let storage = InMemoryDunningStorage::new();
        storage
            .save_dunning_state(&state("cus_1", DunningStatus::Active))
            .await
            .unwrap();

        let err = storage
            .save_dunning_state(&state("cus_1", DunningStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, DunningError::Storage(_)));

        // Terminal history does not block a new process
        storage
            .save_dunning_state(&state("cus_2", DunningStatus::Exhausted))
            .await
            .unwrap();
        storage
            .save_dunning_state(&state("cus_2", DunningStatus::Active))
            .await
            .unwrap();
        assert_eq!(storage.state_count().await, 3);
    }

    #[tokio::test]
    async fn test_get_by_customer_ignores_terminal_states() {
        let storage = InMemoryDunningStorage::new();
        storage
            .save_dunning_state(&state("cus_1", DunningStatus::Recovered))
            .await
            .unwrap();
        assert!(storage.get_dunning_state("cus_1").await.unwrap().is_none());

        let paused = state("cus_1", DunningStatus::Paused);
        storage.save_dunning_state(&paused).await.unwrap();
        let found = storage.get_dunning_state("cus_1").await.unwrap().unwrap();
        assert_eq!(found.id, paused.id);
    }

    #[tokio::test]
    async fn test_scheduled_steps_only_for_active_states() {
        let storage = InMemoryDunningStorage::new();
        let active = state("cus_1", DunningStatus::Active);
        let paused = state("cus_2", DunningStatus::Paused);
        storage.save_dunning_state(&active).await.unwrap();
        storage.save_dunning_state(&paused).await.unwrap();

        let at = datetime!(2024-06-02 10:00 UTC);
        storage.schedule_step(active.id, "retry_1", at).await.unwrap();
        storage.schedule_step(paused.id, "retry_1", at).await.unwrap();

        assert!(storage
            .get_scheduled_steps(datetime!(2024-06-02 9:59 UTC))
            .await
            .unwrap()
            .is_empty());

        let due = storage.get_scheduled_steps(at).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].state_id, active.id);
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_pending_entry() {
        let storage = InMemoryDunningStorage::new();
        let active = state("cus_1", DunningStatus::Active);
        storage.save_dunning_state(&active).await.unwrap();

        storage
            .schedule_step(active.id, "payment_failed", datetime!(2024-06-01 12:00 UTC))
            .await
            .unwrap();
        storage
            .schedule_step(active.id, "retry_1", datetime!(2024-06-04 10:00 UTC))
            .await
            .unwrap();

        let pending = storage.scheduled_step_for(active.id).await.unwrap();
        assert_eq!(pending.step_id, "retry_1");
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = InMemoryDunningStorage::new();
        let active = state("cus_1", DunningStatus::Active);
        storage.save_dunning_state(&active).await.unwrap();
        let at = datetime!(2024-06-01 12:00 UTC);
        storage.schedule_step(active.id, "payment_failed", at).await.unwrap();

        let due = storage.get_scheduled_steps(at).await.unwrap();
        assert!(storage.claim_scheduled_step(&due[0]).await.unwrap());
        assert!(!storage.claim_scheduled_step(&due[0]).await.unwrap());
        assert!(storage.get_scheduled_steps(at).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_update_drops_schedule_and_claims() {
        let storage = InMemoryDunningStorage::new();
        let ended = state("cus_1", DunningStatus::Active);
        let ongoing = state("cus_2", DunningStatus::Active);
        storage.save_dunning_state(&ended).await.unwrap();
        storage.save_dunning_state(&ongoing).await.unwrap();
        let at = datetime!(2024-06-01 12:00 UTC);
        storage.schedule_step(ended.id, "payment_failed", at).await.unwrap();
        storage.schedule_step(ongoing.id, "payment_failed", at).await.unwrap();
        for step in storage.get_scheduled_steps(at).await.unwrap() {
            assert!(storage.claim_scheduled_step(&step).await.unwrap());
        }
        assert_eq!(storage.claim_count().await, 2);

        let update = DunningStateUpdate {
            status: Some(DunningStatus::Exhausted),
            ..Default::default()
        };
        storage.update_dunning_state(ended.id, &update).await.unwrap();

        assert!(storage.scheduled_step_for(ended.id).await.is_none());
        assert!(storage.scheduled_step_for(ongoing.id).await.is_some());
        assert_eq!(storage.claim_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_missing_state() {
        let storage = InMemoryDunningStorage::new();
        let err = storage
            .update_dunning_state(Uuid::new_v4(), &DunningStateUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DunningError::StateNotFound(_)));
    }
}
