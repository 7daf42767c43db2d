//! Injected side-effecting callbacks
//!
//! The manager never talks to a payment provider, an email service or an
//! access-control system directly. Integrators implement these traits and hand
//! them to `DunningConfig`. Every callback is optional; an action whose
//! callback is missing is skipped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::{DunningNotification, StepExecutionContext};
use crate::error::DunningResult;
use crate::types::{AccessLevel, CustomerSnapshot, NotificationChannel};

/// Reason passed to `SubscriptionCanceller` by the `cancel` action
pub const CANCEL_REASON_DUNNING_EXHAUSTED: &str = "dunning_exhausted";

/// Result of a payment retry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub success: bool,
    pub transaction_id: Option<String>,
    /// Provider decline message when `success` is false
    pub error: Option<String>,
}

impl RetryOutcome {
    pub fn succeeded(transaction_id: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            error: None,
        }
    }

    pub fn declined(error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            error: Some(error.into()),
        }
    }
}

/// Delivery report for one notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub success: bool,
    pub channel: NotificationChannel,
    pub error: Option<String>,
}

impl NotificationResult {
    pub fn delivered(channel: NotificationChannel) -> Self {
        Self {
            success: true,
            channel,
            error: None,
        }
    }

    pub fn failed(channel: NotificationChannel, error: impl Into<String>) -> Self {
        Self {
            success: false,
            channel,
            error: Some(error.into()),
        }
    }
}

/// Charges the customer again. Money movement correctness lives here, not in
/// the manager.
#[async_trait]
pub trait PaymentRetrier: Send + Sync {
    async fn retry_payment(&self, context: &StepExecutionContext) -> DunningResult<RetryOutcome>;
}

#[async_trait]
pub trait AccessController: Send + Sync {
    async fn update_access(&self, customer_id: &str, level: AccessLevel) -> DunningResult<()>;
}

#[async_trait]
pub trait SubscriptionCanceller: Send + Sync {
    async fn cancel_subscription(&self, subscription_id: &str, reason: &str) -> DunningResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &DunningNotification) -> DunningResult<NotificationResult>;
}

/// Resolves customer details (email, tier) for sequence selection and
/// notification recipients
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn get_customer(&self, customer_id: &str) -> DunningResult<Option<CustomerSnapshot>>;
}

/// Step-level handler for the `custom` action
#[async_trait]
pub trait CustomAction: Send + Sync {
    async fn run(&self, context: &StepExecutionContext) -> DunningResult<()>;
}

/// The full set of optional callbacks
#[derive(Clone, Default)]
pub struct DunningCallbacks {
    pub payment_retrier: Option<Arc<dyn PaymentRetrier>>,
    pub access_controller: Option<Arc<dyn AccessController>>,
    pub subscription_canceller: Option<Arc<dyn SubscriptionCanceller>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub customer_directory: Option<Arc<dyn CustomerDirectory>>,
}

impl std::fmt::Debug for DunningCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DunningCallbacks")
            .field("payment_retrier", &self.payment_retrier.is_some())
            .field("access_controller", &self.access_controller.is_some())
            .field("subscription_canceller", &self.subscription_canceller.is_some())
            .field("notifier", &self.notifier.is_some())
            .field("customer_directory", &self.customer_directory.is_some())
            .finish()
    }
}
