//! Recording fakes shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::callbacks::{
    AccessController, CustomAction, CustomerDirectory, NotificationResult, Notifier,
    PaymentRetrier, RetryOutcome, SubscriptionCanceller,
};
use crate::config::DunningConfig;
use crate::context::{DunningNotification, StepExecutionContext};
use crate::error::{DunningError, DunningResult};
use crate::events::DunningEvent;
use crate::manager::DunningManager;
use crate::storage::InMemoryDunningStorage;
use crate::sequence::STANDARD_SAAS;
use crate::types::{AccessLevel, CustomerSnapshot, DunningState, DunningStatus, PaymentFailure};

pub const FAILED_AT: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

pub fn failure(customer_id: &str, amount_cents: i64) -> PaymentFailure {
    PaymentFailure::new(customer_id, "sub_1", amount_cents, "usd", FAILED_AT)
}

/// Fresh active state on the standard sequence, not persisted anywhere
pub fn active_state(customer_id: &str, amount_cents: i64) -> DunningState {
    let initial = failure(customer_id, amount_cents);
    DunningState {
        id: Uuid::new_v4(),
        customer_id: customer_id.to_string(),
        subscription_id: initial.subscription_id.clone(),
        sequence_id: STANDARD_SAAS.to_string(),
        current_step_index: 0,
        current_step_id: "payment_failed".to_string(),
        status: DunningStatus::Active,
        initial_failure: initial.clone(),
        failures: vec![initial],
        executed_steps: Vec::new(),
        started_at: FAILED_AT,
        last_step_at: None,
        next_step_at: Some(FAILED_AT),
        ended_at: None,
        end_reason: None,
        total_retry_attempts: 0,
        metadata: HashMap::new(),
    }
}

/// Manually advanced clock
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<OffsetDateTime>>);

impl TestClock {
    pub fn at(now: OffsetDateTime) -> Self {
        Self(Arc::new(Mutex::new(now)))
    }

    pub fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.0.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().unwrap();
        *now += by;
    }

    pub fn install(&self, config: DunningConfig) -> DunningConfig {
        let clock = self.clone();
        config.with_clock(Arc::new(move || clock.now()))
    }
}

/// Retrier returning queued outcomes, then declining
#[derive(Default)]
pub struct FakeRetrier {
    outcomes: Mutex<VecDeque<DunningResult<RetryOutcome>>>,
    pub calls: Mutex<Vec<StepExecutionContext>>,
}

impl FakeRetrier {
    pub fn declining() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_outcomes(outcomes: Vec<DunningResult<RetryOutcome>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentRetrier for FakeRetrier {
    async fn retry_payment(&self, context: &StepExecutionContext) -> DunningResult<RetryOutcome> {
        self.calls.lock().unwrap().push(context.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RetryOutcome::declined("card_declined")))
    }
}

#[derive(Default)]
pub struct FakeAccess {
    pub levels: Mutex<Vec<(String, AccessLevel)>>,
    pub fail: bool,
}

impl FakeAccess {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Default::default()
        })
    }

    pub fn levels(&self) -> Vec<AccessLevel> {
        self.levels.lock().unwrap().iter().map(|(_, l)| *l).collect()
    }
}

#[async_trait]
impl AccessController for FakeAccess {
    async fn update_access(&self, customer_id: &str, level: AccessLevel) -> DunningResult<()> {
        self.levels
            .lock()
            .unwrap()
            .push((customer_id.to_string(), level));
        if self.fail {
            return Err(DunningError::Callback("access service unavailable".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCanceller {
    pub canceled: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SubscriptionCanceller for FakeCanceller {
    async fn cancel_subscription(&self, subscription_id: &str, reason: &str) -> DunningResult<()> {
        self.canceled
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), reason.to_string()));
        Ok(())
    }
}

/// Records every notification. Channels listed in `failing` return an error.
#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<DunningNotification>>,
    pub failing: Vec<crate::types::NotificationChannel>,
}

impl FakeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<DunningNotification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn send(&self, notification: &DunningNotification) -> DunningResult<NotificationResult> {
        self.sent.lock().unwrap().push(notification.clone());
        if self.failing.contains(&notification.channel) {
            return Err(DunningError::Callback(format!(
                "{} provider down",
                notification.channel
            )));
        }
        Ok(NotificationResult::delivered(notification.channel))
    }
}

#[derive(Default)]
pub struct FakeDirectory {
    pub customers: Vec<CustomerSnapshot>,
}

#[async_trait]
impl CustomerDirectory for FakeDirectory {
    async fn get_customer(&self, customer_id: &str) -> DunningResult<Option<CustomerSnapshot>> {
        Ok(self.customers.iter().find(|c| c.id == customer_id).cloned())
    }
}

#[derive(Default)]
pub struct FakeCustomAction {
    pub runs: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl CustomAction for FakeCustomAction {
    async fn run(&self, context: &StepExecutionContext) -> DunningResult<()> {
        self.runs.lock().unwrap().push(context.step_id.clone());
        if self.fail {
            return Err(DunningError::Callback("custom webhook rejected".into()));
        }
        Ok(())
    }
}

/// Collects every emitted event in delivery order
pub fn record_events(manager: &DunningManager) -> Arc<Mutex<Vec<DunningEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager.on_event(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    events
}

pub fn event_types(events: &Mutex<Vec<DunningEvent>>) -> Vec<&'static str> {
    events
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.event_type.as_str())
        .collect()
}

/// Everything a manager test needs to poke at
pub struct Harness {
    pub manager: DunningManager,
    pub storage: Arc<InMemoryDunningStorage>,
    pub clock: TestClock,
    pub retrier: Arc<FakeRetrier>,
    pub access: Arc<FakeAccess>,
    pub canceller: Arc<FakeCanceller>,
    pub notifier: Arc<FakeNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(DunningConfig::default(), FakeRetrier::declining(), FakeAccess::new())
    }

    pub fn with(config: DunningConfig, retrier: Arc<FakeRetrier>, access: Arc<FakeAccess>) -> Self {
        let storage = Arc::new(InMemoryDunningStorage::new());
        let clock = TestClock::at(FAILED_AT);
        let canceller = Arc::new(FakeCanceller::default());
        let notifier = FakeNotifier::new();

        let config = clock
            .install(config)
            .with_payment_retrier(retrier.clone())
            .with_access_controller(access.clone())
            .with_subscription_canceller(canceller.clone())
            .with_notifier(notifier.clone());
        let manager = DunningManager::new(storage.clone(), config).unwrap();

        Self {
            manager,
            storage,
            clock,
            retrier,
            access,
            canceller,
            notifier,
        }
    }
}
