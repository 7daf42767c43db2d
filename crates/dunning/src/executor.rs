//! Step execution
//!
//! Runs a step's actions in declared order against the injected callbacks.
//! Each action is isolated: a failing callback is recorded on the
//! `ExecutedStep` and the remaining actions still run. A successful payment
//! retry short-circuits the rest of the step.

use time::OffsetDateTime;

use crate::callbacks::{DunningCallbacks, RetryOutcome, CANCEL_REASON_DUNNING_EXHAUSTED};
use crate::context::StepExecutionContext;
use crate::error::{DunningError, DunningResult};
use crate::sequence::DunningStep;
use crate::types::{AccessLevel, DunningAction, ExecutedStep, NotificationChannel};

/// What one action did
#[derive(Debug)]
enum ActionOutcome {
    Notified {
        delivered: Vec<NotificationChannel>,
        errors: Vec<String>,
    },
    PaymentRetried(RetryOutcome),
    AccessUpdated(AccessLevel),
    SubscriptionCanceled,
    CustomCompleted,
    /// The callback this action needs is not configured
    Skipped,
}

/// Accumulates action outcomes into the immutable audit record
#[derive(Default)]
struct StepRecorder {
    actions_executed: Vec<DunningAction>,
    payment_retried: bool,
    payment_succeeded: Option<bool>,
    transaction_id: Option<String>,
    notifications_sent: Vec<NotificationChannel>,
    access_level_applied: Option<AccessLevel>,
    subscription_canceled: bool,
    failed_actions: Vec<DunningAction>,
    errors: Vec<String>,
}

impl StepRecorder {
    fn record(&mut self, action: DunningAction, outcome: ActionOutcome) {
        match outcome {
            ActionOutcome::Skipped => return,
            ActionOutcome::Notified { delivered, errors } => {
                self.notifications_sent.extend(delivered);
                self.errors.extend(errors);
            }
            ActionOutcome::PaymentRetried(retry) => {
                self.payment_retried = true;
                self.payment_succeeded = Some(retry.success);
                self.transaction_id = retry.transaction_id;
            }
            ActionOutcome::AccessUpdated(level) => self.access_level_applied = Some(level),
            ActionOutcome::SubscriptionCanceled => self.subscription_canceled = true,
            ActionOutcome::CustomCompleted => {}
        }
        self.actions_executed.push(action);
    }

    fn record_error(&mut self, action: DunningAction, error: DunningError) {
        self.actions_executed.push(action);
        self.failed_actions.push(action);
        if action == DunningAction::RetryPayment {
            self.payment_retried = true;
            self.payment_succeeded = Some(false);
        }
        self.errors.push(format!("{}: {}", action, error));
    }

    fn finish(self, step: &DunningStep, step_index: usize, executed_at: OffsetDateTime) -> ExecutedStep {
        ExecutedStep {
            step_id: step.id.clone(),
            step_index,
            executed_at,
            actions_executed: self.actions_executed,
            payment_retried: self.payment_retried,
            payment_succeeded: self.payment_succeeded,
            transaction_id: self.transaction_id,
            notifications_sent: self.notifications_sent,
            access_level_applied: self.access_level_applied,
            subscription_canceled: self.subscription_canceled,
            failed_actions: self.failed_actions,
            error: if self.errors.is_empty() {
                None
            } else {
                Some(self.errors.join("; "))
            },
        }
    }
}

pub struct StepExecutor {
    callbacks: DunningCallbacks,
}

impl StepExecutor {
    pub fn new(callbacks: DunningCallbacks) -> Self {
        Self { callbacks }
    }

    /// Run every action of `step`. Never fails: action errors end up on
    /// `ExecutedStep::error`.
    pub async fn execute(&self, step: &DunningStep, context: &StepExecutionContext) -> ExecutedStep {
        let mut recorder = StepRecorder::default();

        for action in &step.actions {
            match self.perform(*action, step, context).await {
                Ok(outcome) => {
                    let recovered = matches!(
                        outcome,
                        ActionOutcome::PaymentRetried(RetryOutcome { success: true, .. })
                    );
                    recorder.record(*action, outcome);
                    if recovered {
                        tracing::info!(
                            state_id = %context.state_id,
                            step_id = %step.id,
                            "Payment retry succeeded, skipping remaining actions"
                        );
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        state_id = %context.state_id,
                        customer_id = %context.customer.id,
                        step_id = %step.id,
                        action = %action,
                        error = %e,
                        "Dunning action failed"
                    );
                    recorder.record_error(*action, e);
                }
            }
        }

        recorder.finish(step, context.step_index, context.executed_at)
    }

    async fn perform(
        &self,
        action: DunningAction,
        step: &DunningStep,
        context: &StepExecutionContext,
    ) -> DunningResult<ActionOutcome> {
        match action {
            DunningAction::Notify => Ok(self.notify(step, context).await),
            DunningAction::RetryPayment => self.retry_payment(context).await,
            DunningAction::LimitFeatures => {
                let level = step.access_level.unwrap_or(AccessLevel::Limited);
                self.update_access(context, level).await
            }
            DunningAction::Suspend => self.update_access(context, AccessLevel::ReadOnly).await,
            DunningAction::Cancel => self.cancel_subscription(context).await,
            DunningAction::Custom => {
                let handler = step.custom_action.as_ref().ok_or_else(|| {
                    DunningError::InvalidConfig(format!(
                        "Step '{}' declares a custom action without a handler",
                        step.id
                    ))
                })?;
                handler.run(context).await?;
                Ok(ActionOutcome::CustomCompleted)
            }
        }
    }

    /// Dispatch to every channel; one channel failing does not stop the others
    async fn notify(&self, step: &DunningStep, context: &StepExecutionContext) -> ActionOutcome {
        let Some(notifier) = self.callbacks.notifier.as_ref() else {
            tracing::debug!(step_id = %step.id, "No notifier configured, skipping notify");
            return ActionOutcome::Skipped;
        };

        let template_id = step.template_id();
        let mut delivered = Vec::new();
        let mut errors = Vec::new();

        for channel in step.channels() {
            let notification = context.notification(channel, template_id.clone());
            match notifier.send(&notification).await {
                Ok(result) if result.success => delivered.push(channel),
                Ok(result) => {
                    tracing::warn!(
                        customer_id = %context.customer.id,
                        channel = %channel,
                        error = ?result.error,
                        "Dunning notification not delivered"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        customer_id = %context.customer.id,
                        channel = %channel,
                        error = %e,
                        "Dunning notification failed"
                    );
                    errors.push(format!("notify({}): {}", channel, e));
                }
            }
        }

        ActionOutcome::Notified { delivered, errors }
    }

    async fn retry_payment(&self, context: &StepExecutionContext) -> DunningResult<ActionOutcome> {
        let Some(retrier) = self.callbacks.payment_retrier.as_ref() else {
            tracing::debug!(state_id = %context.state_id, "No payment retrier configured, skipping retry");
            return Ok(ActionOutcome::Skipped);
        };

        let outcome = retrier.retry_payment(context).await?;
        tracing::info!(
            state_id = %context.state_id,
            customer_id = %context.customer.id,
            success = outcome.success,
            transaction_id = ?outcome.transaction_id,
            "Dunning payment retry attempted"
        );
        Ok(ActionOutcome::PaymentRetried(outcome))
    }

    async fn update_access(
        &self,
        context: &StepExecutionContext,
        level: AccessLevel,
    ) -> DunningResult<ActionOutcome> {
        let Some(controller) = self.callbacks.access_controller.as_ref() else {
            tracing::debug!(state_id = %context.state_id, "No access controller configured, skipping access update");
            return Ok(ActionOutcome::Skipped);
        };

        controller.update_access(&context.customer.id, level).await?;
        tracing::info!(
            customer_id = %context.customer.id,
            access_level = %level,
            "Customer access updated by dunning"
        );
        Ok(ActionOutcome::AccessUpdated(level))
    }

    async fn cancel_subscription(&self, context: &StepExecutionContext) -> DunningResult<ActionOutcome> {
        let Some(canceller) = self.callbacks.subscription_canceller.as_ref() else {
            tracing::debug!(state_id = %context.state_id, "No subscription canceller configured, skipping cancel");
            return Ok(ActionOutcome::Skipped);
        };

        canceller
            .cancel_subscription(&context.subscription_id, CANCEL_REASON_DUNNING_EXHAUSTED)
            .await?;
        tracing::warn!(
            customer_id = %context.customer.id,
            subscription_id = %context.subscription_id,
            "Subscription canceled by dunning"
        );
        Ok(ActionOutcome::SubscriptionCanceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::DunningUrls;
    use crate::test_support::{
        active_state, FakeAccess, FakeCanceller, FakeCustomAction, FakeNotifier, FakeRetrier,
        FAILED_AT,
    };
    use crate::types::CustomerSnapshot;

    fn context_for(step: &DunningStep) -> StepExecutionContext {
        let state = active_state("cus_1", 2_900);
        StepExecutionContext::build(
            &state,
            step,
            CustomerSnapshot::bare("cus_1"),
            &DunningUrls::default(),
            FAILED_AT,
        )
    }

    fn callbacks(
        retrier: Arc<FakeRetrier>,
        access: Arc<FakeAccess>,
        notifier: Arc<FakeNotifier>,
        canceller: Arc<FakeCanceller>,
    ) -> DunningCallbacks {
        DunningCallbacks {
            payment_retrier: Some(retrier),
            access_controller: Some(access),
            subscription_canceller: Some(canceller),
            notifier: Some(notifier),
            customer_directory: None,
        }
    }

    #[tokio::test]
    async fn test_successful_retry_skips_remaining_actions() {
        let retrier = FakeRetrier::with_outcomes(vec![Ok(RetryOutcome::succeeded("txn_42"))]);
        let access = FakeAccess::new();
        let notifier = FakeNotifier::new();
        let canceller = Arc::new(FakeCanceller::default());
        let executor = StepExecutor::new(callbacks(
            retrier.clone(),
            access.clone(),
            notifier.clone(),
            canceller.clone(),
        ));

        let step = DunningStep::new(
            "final_attempt",
            28,
            vec![
                DunningAction::RetryPayment,
                DunningAction::Notify,
                DunningAction::Cancel,
            ],
        )
        .final_step();
        let executed = executor.execute(&step, &context_for(&step)).await;

        assert_eq!(executed.actions_executed, vec![DunningAction::RetryPayment]);
        assert!(executed.payment_recovered());
        assert_eq!(executed.transaction_id.as_deref(), Some("txn_42"));
        assert!(notifier.sent().is_empty());
        assert!(canceller.canceled.lock().unwrap().is_empty());
        assert!(!executed.subscription_canceled);
        assert!(executed.error.is_none());
    }

    #[tokio::test]
    async fn test_failing_action_does_not_stop_later_actions() {
        let access = FakeAccess::failing();
        let notifier = FakeNotifier::new();
        let executor = StepExecutor::new(callbacks(
            FakeRetrier::declining(),
            access.clone(),
            notifier.clone(),
            Arc::new(FakeCanceller::default()),
        ));

        let step = DunningStep::new(
            "limit_access",
            10,
            vec![DunningAction::LimitFeatures, DunningAction::Notify],
        );
        let executed = executor.execute(&step, &context_for(&step)).await;

        assert_eq!(
            executed.actions_executed,
            vec![DunningAction::LimitFeatures, DunningAction::Notify]
        );
        assert_eq!(executed.failed_actions, vec![DunningAction::LimitFeatures]);
        assert!(executed.access_level_applied.is_none());
        assert_eq!(notifier.sent().len(), 1);
        assert_eq!(executed.notifications_sent, vec![NotificationChannel::Email]);
        let error = executed.error.unwrap();
        assert!(error.contains("limit_features"));
        assert!(error.contains("access service unavailable"));
    }

    #[tokio::test]
    async fn test_errors_are_joined_in_action_order() {
        let retrier = FakeRetrier::with_outcomes(vec![Err(DunningError::Callback(
            "gateway timeout".into(),
        ))]);
        let executor = StepExecutor::new(callbacks(
            retrier,
            FakeAccess::failing(),
            FakeNotifier::new(),
            Arc::new(FakeCanceller::default()),
        ));

        let step = DunningStep::new(
            "retry_and_suspend",
            14,
            vec![DunningAction::RetryPayment, DunningAction::Suspend],
        );
        let executed = executor.execute(&step, &context_for(&step)).await;

        assert!(executed.payment_retried);
        assert_eq!(executed.payment_succeeded, Some(false));
        assert_eq!(
            executed.error.as_deref(),
            Some(
                "retry_payment: Callback failed: gateway timeout; \
                 suspend: Callback failed: access service unavailable"
            )
        );
    }

    #[tokio::test]
    async fn test_access_levels_per_action() {
        let access = FakeAccess::new();
        let executor = StepExecutor::new(callbacks(
            FakeRetrier::declining(),
            access.clone(),
            FakeNotifier::new(),
            Arc::new(FakeCanceller::default()),
        ));

        let limit = DunningStep::new("limit", 10, vec![DunningAction::LimitFeatures]);
        executor.execute(&limit, &context_for(&limit)).await;

        let read_only = DunningStep::new("limit_hard", 12, vec![DunningAction::LimitFeatures])
            .with_access_level(AccessLevel::ReadOnly);
        executor.execute(&read_only, &context_for(&read_only)).await;

        let suspend = DunningStep::new("suspend", 21, vec![DunningAction::Suspend]);
        let executed = executor.execute(&suspend, &context_for(&suspend)).await;

        assert_eq!(
            access.levels(),
            vec![AccessLevel::Limited, AccessLevel::ReadOnly, AccessLevel::ReadOnly]
        );
        assert_eq!(executed.access_level_applied, Some(AccessLevel::ReadOnly));
    }

    #[tokio::test]
    async fn test_cancel_uses_exhausted_reason() {
        let canceller = Arc::new(FakeCanceller::default());
        let executor = StepExecutor::new(callbacks(
            FakeRetrier::declining(),
            FakeAccess::new(),
            FakeNotifier::new(),
            canceller.clone(),
        ));

        let step = DunningStep::new("cancel", 28, vec![DunningAction::Cancel]).final_step();
        let executed = executor.execute(&step, &context_for(&step)).await;

        assert!(executed.subscription_canceled);
        assert_eq!(
            canceller.canceled.lock().unwrap().clone(),
            vec![("sub_1".to_string(), "dunning_exhausted".to_string())]
        );
    }

    #[tokio::test]
    async fn test_notify_fans_out_and_isolates_channels() {
        let notifier = Arc::new(FakeNotifier {
            failing: vec![NotificationChannel::Sms],
            ..Default::default()
        });
        let executor = StepExecutor::new(callbacks(
            FakeRetrier::declining(),
            FakeAccess::new(),
            notifier.clone(),
            Arc::new(FakeCanceller::default()),
        ));

        let step = DunningStep::new("suspend", 21, vec![DunningAction::Notify]).with_channels(vec![
            NotificationChannel::Sms,
            NotificationChannel::Email,
        ]);
        let executed = executor.execute(&step, &context_for(&step)).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|n| n.template_id == "dunning_suspend"));
        assert_eq!(executed.notifications_sent, vec![NotificationChannel::Email]);
        assert!(executed.error.unwrap().starts_with("notify(sms)"));
    }

    #[tokio::test]
    async fn test_missing_callbacks_are_skipped() {
        let executor = StepExecutor::new(DunningCallbacks::default());
        let step = DunningStep::new(
            "retry_1",
            3,
            vec![DunningAction::RetryPayment, DunningAction::Notify],
        );
        let executed = executor.execute(&step, &context_for(&step)).await;

        assert!(executed.actions_executed.is_empty());
        assert!(!executed.payment_retried);
        assert!(executed.payment_succeeded.is_none());
        assert!(executed.error.is_none());
    }

    #[tokio::test]
    async fn test_custom_action() {
        let handler = Arc::new(FakeCustomAction::default());
        let executor = StepExecutor::new(DunningCallbacks::default());

        let step = DunningStep::new("crm_sync", 5, vec![DunningAction::Custom])
            .with_custom_action(handler.clone());
        let executed = executor.execute(&step, &context_for(&step)).await;
        assert_eq!(executed.actions_executed, vec![DunningAction::Custom]);
        assert_eq!(handler.runs.lock().unwrap().clone(), vec!["crm_sync".to_string()]);

        let unbound = DunningStep::new("crm_sync", 5, vec![DunningAction::Custom]);
        let executed = executor.execute(&unbound, &context_for(&unbound)).await;
        assert_eq!(executed.failed_actions, vec![DunningAction::Custom]);
        assert!(executed.error.unwrap().contains("without a handler"));
    }
}
