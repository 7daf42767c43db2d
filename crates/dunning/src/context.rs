//! Step execution context and notification payloads
//!
//! The context is a snapshot taken right before a step runs. It is what step
//! conditions, custom actions and the payment retrier see.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::DunningUrls;
use crate::sequence::DunningStep;
use crate::types::{CustomerSnapshot, DunningState, NotificationChannel};

/// Snapshot handed to conditions, custom actions and callbacks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionContext {
    pub state_id: Uuid,
    pub customer: CustomerSnapshot,
    pub subscription_id: String,
    pub sequence_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub is_final: bool,
    /// Whole days since the initial failure
    pub days_since_failure: i64,
    /// Sum over every accumulated failure
    pub amount_owed_cents: i64,
    pub currency: String,
    pub failure_count: usize,
    pub total_retry_attempts: u32,
    pub urls: DunningUrls,
    pub executed_at: OffsetDateTime,
}

impl StepExecutionContext {
    pub fn build(
        state: &DunningState,
        step: &DunningStep,
        customer: CustomerSnapshot,
        urls: &DunningUrls,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            state_id: state.id,
            customer,
            subscription_id: state.subscription_id.clone(),
            sequence_id: state.sequence_id.clone(),
            step_id: step.id.clone(),
            step_index: state.current_step_index,
            is_final: step.is_final,
            days_since_failure: (now - state.initial_failure.failed_at).whole_days(),
            amount_owed_cents: state.total_amount_owed_cents(),
            currency: state.initial_failure.currency.clone(),
            failure_count: state.failures.len(),
            total_retry_attempts: state.total_retry_attempts,
            urls: urls.clone(),
            executed_at: now,
        }
    }

    /// Notification for one channel of the current step
    pub fn notification(
        &self,
        channel: NotificationChannel,
        template_id: impl Into<String>,
    ) -> DunningNotification {
        DunningNotification {
            channel,
            template_id: template_id.into(),
            recipient: NotificationRecipient {
                customer_id: self.customer.id.clone(),
                email: self.customer.email.clone(),
                name: self.customer.name.clone(),
            },
            variables: NotificationVariables {
                amount: format_amount(self.amount_owed_cents),
                amount_cents: self.amount_owed_cents,
                currency: self.currency.clone(),
                days_since_failure: self.days_since_failure,
                failure_count: self.failure_count,
                step_id: self.step_id.clone(),
                is_final: self.is_final,
                customer_name: self.customer.name.clone(),
                update_payment_url: self.urls.update_payment_url.clone(),
                billing_portal_url: self.urls.billing_portal_url.clone(),
                support_email: self.urls.support_email.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecipient {
    pub customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Template variables. Unset optional values are omitted from the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationVariables {
    /// Human readable amount, e.g. "29.00"
    pub amount: String,
    pub amount_cents: i64,
    pub currency: String,
    pub days_since_failure: i64,
    pub failure_count: usize,
    pub step_id: String,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_payment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub billing_portal_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningNotification {
    pub channel: NotificationChannel,
    pub template_id: String,
    pub recipient: NotificationRecipient,
    pub variables: NotificationVariables,
}

fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DunningAction, DunningStatus, PaymentFailure};
    use std::collections::HashMap;
    use time::macros::datetime;

    fn state_with_failures(amounts: &[i64]) -> DunningState {
        let failures: Vec<PaymentFailure> = amounts
            .iter()
            .map(|a| PaymentFailure::new("cus_1", "sub_1", *a, "eur", datetime!(2024-05-01 09:30 UTC)))
            .collect();
        DunningState {
            id: Uuid::new_v4(),
            customer_id: "cus_1".to_string(),
            subscription_id: "sub_1".to_string(),
            sequence_id: "standard_saas".to_string(),
            current_step_index: 1,
            current_step_id: "retry_1".to_string(),
            status: DunningStatus::Active,
            initial_failure: failures[0].clone(),
            failures,
            executed_steps: vec![],
            started_at: datetime!(2024-05-01 09:30 UTC),
            last_step_at: None,
            next_step_at: None,
            ended_at: None,
            end_reason: None,
            total_retry_attempts: 1,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_context_sums_failures_and_counts_days() {
        let state = state_with_failures(&[2_900, 1_050]);
        let step = DunningStep::new("retry_1", 3, vec![DunningAction::RetryPayment]);
        let ctx = StepExecutionContext::build(
            &state,
            &step,
            CustomerSnapshot::bare("cus_1"),
            &DunningUrls::default(),
            datetime!(2024-05-04 10:00 UTC),
        );

        assert_eq!(ctx.amount_owed_cents, 3_950);
        assert_eq!(ctx.currency, "eur");
        assert_eq!(ctx.days_since_failure, 3);
        assert_eq!(ctx.failure_count, 2);
        assert_eq!(ctx.step_index, 1);
    }

    #[test]
    fn test_notification_omits_unset_urls() {
        let state = state_with_failures(&[2_900]);
        let step = DunningStep::new("payment_failed", 0, vec![DunningAction::Notify]);
        let urls = DunningUrls {
            update_payment_url: Some("https://app.example.com/billing".to_string()),
            ..Default::default()
        };
        let ctx = StepExecutionContext::build(
            &state,
            &step,
            CustomerSnapshot::bare("cus_1"),
            &urls,
            datetime!(2024-05-01 09:30 UTC),
        );
        let notification = ctx.notification(NotificationChannel::Email, "dunning_payment_failed");
        let json = serde_json::to_value(&notification.variables).unwrap();

        assert_eq!(json["amount"], "29.00");
        assert_eq!(json["update_payment_url"], "https://app.example.com/billing");
        assert!(json.get("billing_portal_url").is_none());
        assert!(json.get("customer_name").is_none());
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(0), "0.00");
        assert_eq!(format_amount(5), "0.05");
        assert_eq!(format_amount(123_456), "1234.56");
        assert_eq!(format_amount(-250), "-2.50");
    }
}
