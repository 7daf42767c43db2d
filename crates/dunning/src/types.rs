//! Dunning data model
//!
//! Records shared by the manager, the step executor and storage backends.
//! `DunningState` is the only mutable record; `PaymentFailure` and
//! `ExecutedStep` are written once and never changed.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DunningError;

/// Lifecycle status of a dunning process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningStatus {
    Active,
    Recovered,
    Exhausted,
    Canceled,
    Paused,
}

impl DunningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningStatus::Active => "active",
            DunningStatus::Recovered => "recovered",
            DunningStatus::Exhausted => "exhausted",
            DunningStatus::Canceled => "canceled",
            DunningStatus::Paused => "paused",
        }
    }

    /// Recovered, exhausted and canceled states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DunningStatus::Recovered | DunningStatus::Exhausted | DunningStatus::Canceled
        )
    }

    /// Active or paused: the process has not ended yet
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for DunningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DunningStatus {
    type Err = DunningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(DunningStatus::Active),
            "recovered" => Ok(DunningStatus::Recovered),
            "exhausted" => Ok(DunningStatus::Exhausted),
            "canceled" => Ok(DunningStatus::Canceled),
            "paused" => Ok(DunningStatus::Paused),
            other => Err(DunningError::InvalidInput(format!(
                "Unknown dunning status: {}",
                other
            ))),
        }
    }
}

/// Why a dunning process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A retried charge succeeded
    PaymentRecovered,
    /// Payment was resolved outside the dunning flow (card updated, invoice paid)
    PaymentUpdated,
    /// Ran out of steps
    MaxRetries,
    ManuallyCanceled,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::PaymentRecovered => "payment_recovered",
            EndReason::PaymentUpdated => "payment_updated",
            EndReason::MaxRetries => "max_retries",
            EndReason::ManuallyCanceled => "manually_canceled",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndReason {
    type Err = DunningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "payment_recovered" => Ok(EndReason::PaymentRecovered),
            "payment_updated" => Ok(EndReason::PaymentUpdated),
            "max_retries" => Ok(EndReason::MaxRetries),
            "manually_canceled" => Ok(EndReason::ManuallyCanceled),
            other => Err(DunningError::InvalidInput(format!(
                "Unknown end reason: {}",
                other
            ))),
        }
    }
}

/// Product access granted to a customer while in dunning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Full,
    Limited,
    ReadOnly,
    None,
}

impl AccessLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Full => "full",
            AccessLevel::Limited => "limited",
            AccessLevel::ReadOnly => "read_only",
            AccessLevel::None => "none",
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed vocabulary of step actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DunningAction {
    Notify,
    RetryPayment,
    LimitFeatures,
    Suspend,
    Cancel,
    Custom,
}

impl DunningAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningAction::Notify => "notify",
            DunningAction::RetryPayment => "retry_payment",
            DunningAction::LimitFeatures => "limit_features",
            DunningAction::Suspend => "suspend",
            DunningAction::Cancel => "cancel",
            DunningAction::Custom => "custom",
        }
    }
}

impl std::fmt::Display for DunningAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    InApp,
    Push,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Sms => "sms",
            NotificationChannel::InApp => "in_app",
            NotificationChannel::Push => "push",
        }
    }
}

impl std::fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a failed charge, as reported by the payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    CardDeclined,
    InsufficientFunds,
    ExpiredCard,
    AuthenticationRequired,
    ProcessingError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::CardDeclined => "card_declined",
            FailureCategory::InsufficientFunds => "insufficient_funds",
            FailureCategory::ExpiredCard => "expired_card",
            FailureCategory::AuthenticationRequired => "authentication_required",
            FailureCategory::ProcessingError => "processing_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

/// One failed charge. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailure {
    pub id: Uuid,
    pub customer_id: String,
    pub subscription_id: String,
    /// Provider invoice the charge belonged to, if any
    pub invoice_id: Option<String>,
    /// Amount in the smallest currency unit (cents)
    pub amount_cents: i64,
    pub currency: String,
    pub failed_at: OffsetDateTime,
    pub category: FailureCategory,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl PaymentFailure {
    pub fn new(
        customer_id: impl Into<String>,
        subscription_id: impl Into<String>,
        amount_cents: i64,
        currency: impl Into<String>,
        failed_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: customer_id.into(),
            subscription_id: subscription_id.into(),
            invoice_id: None,
            amount_cents,
            currency: currency.into(),
            failed_at,
            category: FailureCategory::Unknown,
            error_code: None,
            error_message: None,
        }
    }

    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.invoice_id = Some(invoice_id.into());
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }
}

/// Audit record for one step run. Append-only; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub step_id: String,
    pub step_index: usize,
    pub executed_at: OffsetDateTime,
    /// Actions that were attempted, in order
    pub actions_executed: Vec<DunningAction>,
    pub payment_retried: bool,
    /// `None` when no retry happened
    pub payment_succeeded: Option<bool>,
    pub transaction_id: Option<String>,
    /// Channels that reported successful delivery
    pub notifications_sent: Vec<NotificationChannel>,
    pub access_level_applied: Option<AccessLevel>,
    pub subscription_canceled: bool,
    /// Actions whose callback returned an error
    pub failed_actions: Vec<DunningAction>,
    /// Captured action errors, joined with "; "
    pub error: Option<String>,
}

impl ExecutedStep {
    pub fn payment_recovered(&self) -> bool {
        self.payment_succeeded == Some(true)
    }

    /// Attempted and did not fail
    pub fn succeeded(&self, action: DunningAction) -> bool {
        self.actions_executed.contains(&action) && !self.failed_actions.contains(&action)
    }
}

/// The per-customer dunning state machine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningState {
    pub id: Uuid,
    pub customer_id: String,
    pub subscription_id: String,
    pub sequence_id: String,
    pub current_step_index: usize,
    pub current_step_id: String,
    pub status: DunningStatus,
    pub initial_failure: PaymentFailure,
    pub failures: Vec<PaymentFailure>,
    pub executed_steps: Vec<ExecutedStep>,
    pub started_at: OffsetDateTime,
    pub last_step_at: Option<OffsetDateTime>,
    pub next_step_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub end_reason: Option<EndReason>,
    pub total_retry_attempts: u32,
    pub metadata: HashMap<String, String>,
}

impl DunningState {
    /// Sum of every accumulated failure's amount
    pub fn total_amount_owed_cents(&self) -> i64 {
        self.failures.iter().map(|f| f.amount_cents).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Partial update applied through `DunningStorage::update_dunning_state`.
/// Only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DunningStateUpdate {
    pub status: Option<DunningStatus>,
    pub current_step_index: Option<usize>,
    pub current_step_id: Option<String>,
    pub failures: Option<Vec<PaymentFailure>>,
    pub executed_steps: Option<Vec<ExecutedStep>>,
    pub last_step_at: Option<OffsetDateTime>,
    pub next_step_at: Option<Option<OffsetDateTime>>,
    pub ended_at: Option<OffsetDateTime>,
    pub end_reason: Option<EndReason>,
    pub total_retry_attempts: Option<u32>,
    pub metadata: Option<HashMap<String, String>>,
}

impl DunningStateUpdate {
    pub fn apply_to(&self, state: &mut DunningState) {
        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(index) = self.current_step_index {
            state.current_step_index = index;
        }
        if let Some(ref step_id) = self.current_step_id {
            state.current_step_id = step_id.clone();
        }
        if let Some(ref failures) = self.failures {
            state.failures = failures.clone();
        }
        if let Some(ref executed) = self.executed_steps {
            state.executed_steps = executed.clone();
        }
        if let Some(at) = self.last_step_at {
            state.last_step_at = Some(at);
        }
        if let Some(next) = self.next_step_at {
            state.next_step_at = next;
        }
        if let Some(at) = self.ended_at {
            state.ended_at = Some(at);
        }
        if let Some(reason) = self.end_reason {
            state.end_reason = Some(reason);
        }
        if let Some(attempts) = self.total_retry_attempts {
            state.total_retry_attempts = attempts;
        }
        if let Some(ref metadata) = self.metadata {
            state.metadata = metadata.clone();
        }
    }
}

/// A pending step execution returned by `DunningStorage::get_scheduled_steps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledStep {
    pub state_id: Uuid,
    pub step_id: String,
    pub scheduled_at: OffsetDateTime,
}

/// Snapshot of a customer, resolved through the optional `CustomerDirectory`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerSnapshot {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    /// Subscription tier used to pick a dunning sequence
    pub tier: Option<String>,
}

impl CustomerSnapshot {
    /// Snapshot carrying only the id, used when no directory is configured
    pub fn bare(customer_id: impl Into<String>) -> Self {
        Self {
            id: customer_id.into(),
            ..Default::default()
        }
    }
}
