//! Dunning lifecycle events
//!
//! Every transition emits exactly one event, synchronously and in order, to
//! each registered handler. Integrators use these to keep billing, access
//! control and analytics in sync.
//!
//! Handler failures (errors and panics) are logged and swallowed: a broken
//! handler never aborts the transition that triggered it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DunningResult;
use crate::types::{AccessLevel, DunningAction, DunningState, EndReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DunningEventType {
    #[serde(rename = "dunning.started")]
    Started,
    #[serde(rename = "dunning.step_executed")]
    StepExecuted,
    #[serde(rename = "dunning.payment_retried")]
    PaymentRetried,
    #[serde(rename = "dunning.access_limited")]
    AccessLimited,
    #[serde(rename = "dunning.suspended")]
    Suspended,
    #[serde(rename = "dunning.payment_recovered")]
    PaymentRecovered,
    #[serde(rename = "dunning.exhausted")]
    Exhausted,
    #[serde(rename = "dunning.paused")]
    Paused,
    #[serde(rename = "dunning.resumed")]
    Resumed,
    #[serde(rename = "dunning.canceled")]
    Canceled,
}

impl DunningEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DunningEventType::Started => "dunning.started",
            DunningEventType::StepExecuted => "dunning.step_executed",
            DunningEventType::PaymentRetried => "dunning.payment_retried",
            DunningEventType::AccessLimited => "dunning.access_limited",
            DunningEventType::Suspended => "dunning.suspended",
            DunningEventType::PaymentRecovered => "dunning.payment_recovered",
            DunningEventType::Exhausted => "dunning.exhausted",
            DunningEventType::Paused => "dunning.paused",
            DunningEventType::Resumed => "dunning.resumed",
            DunningEventType::Canceled => "dunning.canceled",
        }
    }
}

impl std::fmt::Display for DunningEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed payload, one variant per event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DunningEventPayload {
    Started {
        sequence_id: String,
        step_id: String,
        amount_cents: i64,
        currency: String,
        next_step_at: Option<OffsetDateTime>,
    },
    StepExecuted {
        step_id: String,
        step_index: usize,
        actions: Vec<DunningAction>,
        error: Option<String>,
    },
    PaymentRetried {
        step_id: String,
        success: bool,
        transaction_id: Option<String>,
        attempt: u32,
    },
    AccessLimited {
        step_id: String,
        access_level: AccessLevel,
    },
    Suspended {
        step_id: String,
        access_level: AccessLevel,
    },
    PaymentRecovered {
        reason: EndReason,
        amount_recovered_cents: i64,
        transaction_id: Option<String>,
        total_retry_attempts: u32,
        steps_executed: usize,
    },
    Exhausted {
        total_retry_attempts: u32,
        steps_executed: usize,
    },
    Paused {
        step_index: usize,
    },
    Resumed {
        step_id: String,
        next_step_at: Option<OffsetDateTime>,
    },
    Canceled {
        reason: Option<String>,
        step_index: usize,
    },
}

impl DunningEventPayload {
    pub fn event_type(&self) -> DunningEventType {
        match self {
            DunningEventPayload::Started { .. } => DunningEventType::Started,
            DunningEventPayload::StepExecuted { .. } => DunningEventType::StepExecuted,
            DunningEventPayload::PaymentRetried { .. } => DunningEventType::PaymentRetried,
            DunningEventPayload::AccessLimited { .. } => DunningEventType::AccessLimited,
            DunningEventPayload::Suspended { .. } => DunningEventType::Suspended,
            DunningEventPayload::PaymentRecovered { .. } => DunningEventType::PaymentRecovered,
            DunningEventPayload::Exhausted { .. } => DunningEventType::Exhausted,
            DunningEventPayload::Paused { .. } => DunningEventType::Paused,
            DunningEventPayload::Resumed { .. } => DunningEventType::Resumed,
            DunningEventPayload::Canceled { .. } => DunningEventType::Canceled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DunningEvent {
    pub id: Uuid,
    pub event_type: DunningEventType,
    pub customer_id: String,
    pub subscription_id: String,
    pub dunning_state_id: Uuid,
    pub timestamp: OffsetDateTime,
    pub payload: DunningEventPayload,
}

impl DunningEvent {
    pub fn new(state: &DunningState, payload: DunningEventPayload, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: payload.event_type(),
            customer_id: state.customer_id.clone(),
            subscription_id: state.subscription_id.clone(),
            dunning_state_id: state.id,
            timestamp,
            payload,
        }
    }
}

#[async_trait]
pub trait DunningEventHandler: Send + Sync {
    async fn handle(&self, event: &DunningEvent) -> DunningResult<()>;
}

/// Adapter so plain closures can be registered as handlers
pub struct FnEventHandler<F>(pub F);

#[async_trait]
impl<F> DunningEventHandler for FnEventHandler<F>
where
    F: Fn(&DunningEvent) -> DunningResult<()> + Send + Sync,
{
    async fn handle(&self, event: &DunningEvent) -> DunningResult<()> {
        (self.0)(event)
    }
}

/// Observer registry. Delivery is sequential, in registration order.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn DunningEventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: Arc<dyn DunningEventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|p| p.into_inner());
        handlers.push(handler);
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&DunningEvent) -> DunningResult<()> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnEventHandler(handler)));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Delivers to every handler and returns how many failed
    pub async fn emit(&self, event: &DunningEvent) -> usize {
        // Snapshot so no lock is held across handler awaits
        let handlers: Vec<Arc<dyn DunningEventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        let mut failures = 0;
        for handler in handlers {
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        event_type = %event.event_type,
                        dunning_state_id = %event.dunning_state_id,
                        error = %e,
                        "Dunning event handler failed"
                    );
                }
                Err(_) => {
                    failures += 1;
                    tracing::error!(
                        event_type = %event.event_type,
                        dunning_state_id = %event.dunning_state_id,
                        "Dunning event handler panicked"
                    );
                }
            }
        }

        tracing::debug!(
            event_type = %event.event_type,
            customer_id = %event.customer_id,
            failures = failures,
            "Dunning event emitted"
        );
        failures
    }
}
