//! Due-step processing
//!
//! One run pulls the steps due by `now`, claims each one so concurrent
//! workers never execute the same step twice, and hands it to the manager.

use dunning::{DunningManager, ScheduledStep};
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum StepRunResult {
    Executed {
        state_id: Uuid,
        step_id: String,
        payment_recovered: bool,
    },
    /// State ended, was paused, or the step's condition was false
    Skipped { state_id: Uuid, step_id: String },
    /// Another worker claimed it first
    AlreadyClaimed { state_id: Uuid, step_id: String },
    Error {
        state_id: Uuid,
        step_id: String,
        error: String,
        fatal: bool,
    },
}

/// Execute up to `batch_size` due steps, oldest first
pub async fn process_due_steps(
    manager: &DunningManager,
    now: OffsetDateTime,
    batch_size: usize,
) -> Vec<StepRunResult> {
    let due = match manager.due_steps(now).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to load due dunning steps");
            return Vec::new();
        }
    };

    let mut results = Vec::new();
    for step in due.into_iter().take(batch_size) {
        results.push(run_step(manager, step).await);
    }
    results
}

async fn run_step(manager: &DunningManager, step: ScheduledStep) -> StepRunResult {
    let ScheduledStep {
        state_id, step_id, ..
    } = step.clone();

    match manager.claim_due_step(&step).await {
        Ok(true) => {}
        Ok(false) => return StepRunResult::AlreadyClaimed { state_id, step_id },
        Err(e) => {
            return StepRunResult::Error {
                state_id,
                step_id,
                fatal: e.is_config_error(),
                error: e.to_string(),
            }
        }
    }

    match manager.execute_step(state_id).await {
        Ok(Some(executed)) => StepRunResult::Executed {
            state_id,
            step_id,
            payment_recovered: executed.payment_recovered(),
        },
        Ok(None) => StepRunResult::Skipped { state_id, step_id },
        Err(e) => StepRunResult::Error {
            state_id,
            step_id,
            fatal: e.is_config_error(),
            error: e.to_string(),
        },
    }
}

/// Log results of a due-step run
pub fn log_step_results(results: &[StepRunResult]) {
    let executed = results
        .iter()
        .filter(|r| matches!(r, StepRunResult::Executed { .. }))
        .count();
    let recovered = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                StepRunResult::Executed {
                    payment_recovered: true,
                    ..
                }
            )
        })
        .count();
    let skipped = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                StepRunResult::Skipped { .. } | StepRunResult::AlreadyClaimed { .. }
            )
        })
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, StepRunResult::Error { .. }))
        .count();

    info!(
        executed = executed,
        recovered = recovered,
        skipped = skipped,
        errors = errors,
        "Dunning step run complete"
    );

    for result in results {
        if let StepRunResult::Error {
            state_id,
            step_id,
            error,
            fatal,
        } = result
        {
            if *fatal {
                error!(state_id = %state_id, step_id = %step_id, error = %error, "Dunning step misconfigured, will not succeed on retry");
            } else {
                error!(state_id = %state_id, step_id = %step_id, error = %error, "Failed to execute dunning step");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use dunning::{
        DunningConfig, DunningStatus, InMemoryDunningStorage, PaymentFailure,
    };
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    fn manager() -> DunningManager {
        let config = DunningConfig::default().with_clock(Arc::new(|| NOW));
        DunningManager::new(Arc::new(InMemoryDunningStorage::new()), config).unwrap()
    }

    async fn start(manager: &DunningManager, customer_id: &str) -> Uuid {
        manager
            .start_dunning(PaymentFailure::new(customer_id, "sub_1", 2_900, "usd", NOW))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_executes_due_steps_once() {
        let manager = manager();
        let a = start(&manager, "cus_a").await;
        let b = start(&manager, "cus_b").await;

        let results = process_due_steps(&manager, NOW, 100).await;
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, StepRunResult::Executed { step_id, .. } if step_id == "payment_failed")));

        for id in [a, b] {
            let state = manager.get_state(id).await.unwrap().unwrap();
            assert_eq!(state.current_step_id, "retry_1");
        }

        // Next steps are days away
        assert!(process_due_steps(&manager, NOW, 100).await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_bounds_a_run() {
        let manager = manager();
        for customer in ["cus_a", "cus_b", "cus_c"] {
            start(&manager, customer).await;
        }

        assert_eq!(process_due_steps(&manager, NOW, 2).await.len(), 2);
        assert_eq!(process_due_steps(&manager, NOW, 2).await.len(), 1);
    }

    #[tokio::test]
    async fn test_paused_states_are_not_picked_up() {
        let manager = manager();
        let id = start(&manager, "cus_a").await;
        manager.pause_dunning(id).await.unwrap();

        assert!(process_due_steps(&manager, NOW, 100).await.is_empty());
        let state = manager.get_state(id).await.unwrap().unwrap();
        assert_eq!(state.status, DunningStatus::Paused);
        assert!(state.executed_steps.is_empty());
    }

    #[tokio::test]
    async fn test_claimed_step_is_not_executed_again() {
        let manager = manager();
        let id = start(&manager, "cus_a").await;
        let due = manager.due_steps(NOW).await.unwrap();
        assert!(manager.claim_due_step(&due[0]).await.unwrap());

        let result = run_step(&manager, due[0].clone()).await;
        assert_eq!(
            result,
            StepRunResult::AlreadyClaimed {
                state_id: id,
                step_id: "payment_failed".to_string(),
            }
        );
    }
}
