//! Dunning sequences
//!
//! A sequence is an ordered list of steps, each fired at a day offset from the
//! triggering failure. Sequences are static configuration: they are built at
//! startup, stored in a `SequenceCatalog` and never mutated afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use time::{Duration, OffsetDateTime, Time};

use crate::callbacks::CustomAction;
use crate::context::StepExecutionContext;
use crate::error::{DunningError, DunningResult};
use crate::types::{AccessLevel, DunningAction, NotificationChannel};

pub const STANDARD_SAAS: &str = "standard_saas";
pub const AGGRESSIVE: &str = "aggressive";
pub const LENIENT: &str = "lenient";

type Predicate = dyn Fn(&StepExecutionContext) -> bool + Send + Sync;

/// Predicate evaluated against the execution context before a step runs.
/// A false result skips the step.
#[derive(Clone)]
pub struct StepCondition {
    name: String,
    predicate: Arc<Predicate>,
}

impl StepCondition {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&StepExecutionContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Only run when the customer owes at least `cents`
    pub fn min_amount(cents: i64) -> Self {
        Self::new(format!("min_amount({})", cents), move |ctx| {
            ctx.amount_owed_cents >= cents
        })
    }

    /// Only run while fewer than `max` payment retries have been attempted
    pub fn max_retry_attempts(max: u32) -> Self {
        Self::new(format!("max_retry_attempts({})", max), move |ctx| {
            ctx.total_retry_attempts < max
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn evaluate(&self, context: &StepExecutionContext) -> bool {
        (self.predicate)(context)
    }
}

impl std::fmt::Debug for StepCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StepCondition").field(&self.name).finish()
    }
}

/// One stage of a sequence
#[derive(Clone)]
pub struct DunningStep {
    pub id: String,
    /// Offset from the triggering failure (not from the previous step)
    pub days_after_failure: u32,
    /// Hour of day (0-23) the step fires at; minutes and seconds are zeroed
    pub hours_offset: Option<u8>,
    pub actions: Vec<DunningAction>,
    pub condition: Option<StepCondition>,
    pub notification_channels: Vec<NotificationChannel>,
    pub template_id: Option<String>,
    /// Level applied by `limit_features`
    pub access_level: Option<AccessLevel>,
    pub custom_action: Option<Arc<dyn CustomAction>>,
    pub is_final: bool,
}

impl DunningStep {
    pub fn new(id: impl Into<String>, days_after_failure: u32, actions: Vec<DunningAction>) -> Self {
        Self {
            id: id.into(),
            days_after_failure,
            hours_offset: None,
            actions,
            condition: None,
            notification_channels: Vec::new(),
            template_id: None,
            access_level: None,
            custom_action: None,
            is_final: false,
        }
    }

    pub fn at_hour(mut self, hour: u8) -> Self {
        self.hours_offset = Some(hour);
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.notification_channels = channels;
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        self.access_level = Some(level);
        self
    }

    pub fn with_custom_action(mut self, action: Arc<dyn CustomAction>) -> Self {
        self.custom_action = Some(action);
        self
    }

    pub fn final_step(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn template_id(&self) -> String {
        self.template_id
            .clone()
            .unwrap_or_else(|| format!("dunning_{}", self.id))
    }

    /// Channels for the `notify` action. Email when none are declared.
    pub fn channels(&self) -> Vec<NotificationChannel> {
        if self.notification_channels.is_empty() {
            vec![NotificationChannel::Email]
        } else {
            self.notification_channels.clone()
        }
    }

    /// Rejects an hour of day outside 0-23
    pub fn validate(&self) -> DunningResult<()> {
        match self.hours_offset {
            Some(hour) if hour > 23 => Err(DunningError::InvalidConfig(format!(
                "Step '{}' has invalid hours_offset {} (expected 0-23)",
                self.id, hour
            ))),
            _ => Ok(()),
        }
    }

    /// `base + days_after_failure`, with the hour pinned when `hours_offset` is set.
    ///
    /// The manager passes the sequence start as `base` when advancing and the
    /// current time when resuming a paused process.
    pub fn scheduled_at(&self, base: OffsetDateTime) -> DunningResult<OffsetDateTime> {
        let at = base + Duration::days(i64::from(self.days_after_failure));
        match self.hours_offset {
            Some(hour) => {
                let time = Time::from_hms(hour, 0, 0).map_err(|e| {
                    DunningError::InvalidConfig(format!(
                        "Step '{}' has invalid hours_offset {}: {}",
                        self.id, hour, e
                    ))
                })?;
                Ok(at.replace_time(time))
            }
            None => Ok(at),
        }
    }
}

impl std::fmt::Debug for DunningStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DunningStep")
            .field("id", &self.id)
            .field("days_after_failure", &self.days_after_failure)
            .field("hours_offset", &self.hours_offset)
            .field("actions", &self.actions)
            .field("condition", &self.condition)
            .field("notification_channels", &self.notification_channels)
            .field("access_level", &self.access_level)
            .field("custom_action", &self.custom_action.is_some())
            .field("is_final", &self.is_final)
            .finish()
    }
}

/// A named dunning policy
#[derive(Debug, Clone)]
pub struct DunningSequence {
    pub id: String,
    pub name: String,
    pub steps: Vec<DunningStep>,
    pub max_duration_days: u32,
}

impl DunningSequence {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        max_duration_days: u32,
        steps: Vec<DunningStep>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps,
            max_duration_days,
        }
    }

    /// First step, or `EmptySequence` for a sequence with no steps
    pub fn first_step(&self) -> DunningResult<&DunningStep> {
        self.steps
            .first()
            .ok_or_else(|| DunningError::EmptySequence(self.id.clone()))
    }

    /// Every step must be schedulable
    pub fn validate(&self) -> DunningResult<()> {
        self.steps.iter().try_for_each(DunningStep::validate)
    }

    pub fn step(&self, index: usize) -> Option<&DunningStep> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Immutable registry of sequences keyed by id
#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    sequences: HashMap<String, Arc<DunningSequence>>,
}

impl SequenceCatalog {
    pub fn new(sequences: impl IntoIterator<Item = DunningSequence>) -> Self {
        Self {
            sequences: sequences
                .into_iter()
                .map(|s| (s.id.clone(), Arc::new(s)))
                .collect(),
        }
    }

    /// The three shipped policies: `standard_saas`, `aggressive`, `lenient`
    pub fn builtin() -> Self {
        Self::new([standard_saas(), aggressive(), lenient()])
    }

    /// Adds or replaces a sequence. Meant for startup configuration only.
    pub fn with_sequence(mut self, sequence: DunningSequence) -> Self {
        self.sequences
            .insert(sequence.id.clone(), Arc::new(sequence));
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<DunningSequence>> {
        self.sequences.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sequences.contains_key(id)
    }

    pub fn validate(&self) -> DunningResult<()> {
        self.sequences
            .values()
            .try_for_each(|sequence| sequence.validate())
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.sequences.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Standard 28-day SaaS flow
pub fn standard_saas() -> DunningSequence {
    use DunningAction::*;
    use NotificationChannel::*;

    DunningSequence::new(
        STANDARD_SAAS,
        "Standard SaaS (28 days)",
        28,
        vec![
            DunningStep::new("payment_failed", 0, vec![Notify]),
            DunningStep::new("retry_1", 3, vec![RetryPayment, Notify]).at_hour(10),
            DunningStep::new("retry_2", 7, vec![RetryPayment, Notify])
                .at_hour(10)
                .with_channels(vec![Email, InApp]),
            DunningStep::new("limit_access", 10, vec![LimitFeatures, Notify])
                .with_access_level(AccessLevel::Limited)
                .with_channels(vec![Email, InApp]),
            DunningStep::new("retry_3", 14, vec![RetryPayment, Notify])
                .at_hour(10)
                .with_channels(vec![Email, Sms]),
            DunningStep::new("suspend", 21, vec![Suspend, Notify]).with_channels(vec![Email, Sms]),
            DunningStep::new("final_attempt", 28, vec![RetryPayment, Notify, Cancel])
                .at_hour(10)
                .with_channels(vec![Email, Sms])
                .final_step(),
        ],
    )
}

/// Short B2C flow
pub fn aggressive() -> DunningSequence {
    use DunningAction::*;

    DunningSequence::new(
        AGGRESSIVE,
        "Aggressive (10 days)",
        10,
        vec![
            DunningStep::new("payment_failed", 0, vec![Notify]),
            DunningStep::new("retry_1", 2, vec![RetryPayment, Notify]),
            DunningStep::new("retry_2", 5, vec![RetryPayment, Suspend, Notify]),
            DunningStep::new("final_attempt", 10, vec![RetryPayment, Cancel, Notify]).final_step(),
        ],
    )
}

/// Enterprise flow. Never cancels automatically; exhaustion is left to account managers.
pub fn lenient() -> DunningSequence {
    use DunningAction::*;
    use NotificationChannel::*;

    DunningSequence::new(
        LENIENT,
        "Lenient (45 days)",
        45,
        vec![
            DunningStep::new("payment_failed", 0, vec![Notify]),
            DunningStep::new("retry_1", 5, vec![RetryPayment, Notify]).at_hour(14),
            DunningStep::new("retry_2", 12, vec![RetryPayment, Notify]).at_hour(14),
            DunningStep::new("retry_3", 20, vec![RetryPayment, Notify])
                .at_hour(14)
                .with_channels(vec![Email, InApp]),
            DunningStep::new("limit_access", 30, vec![LimitFeatures, Notify])
                .with_access_level(AccessLevel::Limited)
                .with_channels(vec![Email, InApp]),
            DunningStep::new("final_attempt", 45, vec![RetryPayment, Notify])
                .at_hour(14)
                .final_step(),
        ],
    )
}
