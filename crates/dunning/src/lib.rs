// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Dunning Module
//!
//! Automated recovery from failed subscription payments. A payment failure
//! drives the customer through a time-phased sequence of steps (notify, retry
//! the charge, restrict features, suspend, cancel) until the payment is
//! recovered or the sequence runs out.
//!
//! ## Features
//!
//! - **Sequences**: Built-in 28-day SaaS, aggressive B2C and lenient enterprise policies
//! - **State Machine**: One in-flight process per customer, with recovery, exhaustion, pause and cancel
//! - **Step Execution**: Ordered actions with per-action error isolation and success short-circuit
//! - **Events**: Synchronous lifecycle events for billing, access control and analytics sync
//! - **Storage**: Pluggable backend, with in-memory and Postgres implementations
//!
//! The core never calls a payment provider or notification service itself and
//! never runs timers: side effects go through the callbacks in `DunningConfig`,
//! and an external scheduler drives `DunningManager::execute_step`.

pub mod callbacks;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod manager;
pub mod sequence;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_support;


// Callbacks
pub use callbacks::{
    AccessController, CustomAction, CustomerDirectory, DunningCallbacks, NotificationResult,
    Notifier, PaymentRetrier, RetryOutcome, SubscriptionCanceller,
    CANCEL_REASON_DUNNING_EXHAUSTED,
};

// Config
pub use config::{Clock, DunningConfig, DunningUrls};

// Context
pub use context::{
    DunningNotification, NotificationRecipient, NotificationVariables, StepExecutionContext,
};

// Error
pub use error::{DunningError, DunningResult};

// Events
pub use events::{
    DunningEvent, DunningEventHandler, DunningEventPayload, DunningEventType, EventBus,
    FnEventHandler,
};

// Executor
pub use executor::StepExecutor;

// Manager
pub use manager::{DunningManager, CANCEL_REASON_KEY};

// Sequences
pub use sequence::{
    DunningSequence, DunningStep, SequenceCatalog, StepCondition, AGGRESSIVE, LENIENT,
    STANDARD_SAAS,
};

// Storage
pub use storage::{DunningStorage, InMemoryDunningStorage, PgDunningStorage};

// Types
pub use types::{
    AccessLevel, CustomerSnapshot, DunningAction, DunningState, DunningStateUpdate, DunningStatus,
    EndReason, ExecutedStep, FailureCategory, NotificationChannel, PaymentFailure, ScheduledStep,
};
