//! Dunning configuration
//!
//! Everything the manager needs is fixed at construction time: the sequence
//! catalog, how customers map onto sequences, the URLs injected into
//! notifications, and the optional callbacks.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::callbacks::{
    AccessController, CustomerDirectory, DunningCallbacks, Notifier, PaymentRetrier,
    SubscriptionCanceller,
};
use crate::error::{DunningError, DunningResult};
use crate::events::DunningEventHandler;
use crate::sequence::{SequenceCatalog, STANDARD_SAAS};

/// Source of "now". Swappable so tests can pin time.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Links included in every notification's variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DunningUrls {
    pub update_payment_url: Option<String>,
    pub billing_portal_url: Option<String>,
    pub support_email: Option<String>,
}

impl DunningUrls {
    pub fn from_env() -> Self {
        Self {
            update_payment_url: non_empty_env("DUNNING_UPDATE_PAYMENT_URL"),
            billing_portal_url: non_empty_env("DUNNING_BILLING_PORTAL_URL"),
            support_email: non_empty_env("DUNNING_SUPPORT_EMAIL"),
        }
    }
}

#[derive(Clone)]
pub struct DunningConfig {
    pub sequences: SequenceCatalog,
    pub default_sequence_id: String,
    /// Customer tier -> sequence id
    pub tier_sequences: HashMap<String, String>,
    pub urls: DunningUrls,
    pub callbacks: DunningCallbacks,
    /// Global event sink, registered before any `on_event` handler
    pub event_sink: Option<Arc<dyn DunningEventHandler>>,
    clock: Clock,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            sequences: SequenceCatalog::builtin(),
            default_sequence_id: STANDARD_SAAS.to_string(),
            tier_sequences: HashMap::new(),
            urls: DunningUrls::default(),
            callbacks: DunningCallbacks::default(),
            event_sink: None,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }
}

impl DunningConfig {
    pub fn new(sequences: SequenceCatalog, default_sequence_id: impl Into<String>) -> Self {
        Self {
            sequences,
            default_sequence_id: default_sequence_id.into(),
            ..Default::default()
        }
    }

    /// Built-in catalog, with the default sequence, tier mapping and URLs
    /// read from the environment
    pub fn from_env() -> DunningResult<Self> {
        let mut config = Self {
            urls: DunningUrls::from_env(),
            ..Default::default()
        };
        if let Some(default_id) = non_empty_env("DUNNING_DEFAULT_SEQUENCE") {
            config.default_sequence_id = default_id;
        }
        if let Some(raw) = non_empty_env("DUNNING_TIER_SEQUENCES") {
            config.tier_sequences = parse_tier_sequences(&raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_tier_sequence(mut self, tier: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        self.tier_sequences.insert(tier.into(), sequence_id.into());
        self
    }

    pub fn with_urls(mut self, urls: DunningUrls) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_payment_retrier(mut self, retrier: Arc<dyn PaymentRetrier>) -> Self {
        self.callbacks.payment_retrier = Some(retrier);
        self
    }

    pub fn with_access_controller(mut self, controller: Arc<dyn AccessController>) -> Self {
        self.callbacks.access_controller = Some(controller);
        self
    }

    pub fn with_subscription_canceller(mut self, canceller: Arc<dyn SubscriptionCanceller>) -> Self {
        self.callbacks.subscription_canceller = Some(canceller);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.callbacks.notifier = Some(notifier);
        self
    }

    pub fn with_customer_directory(mut self, directory: Arc<dyn CustomerDirectory>) -> Self {
        self.callbacks.customer_directory = Some(directory);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn DunningEventHandler>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    /// Every referenced sequence id must exist in the catalog and every
    /// catalog step must be schedulable
    pub fn validate(&self) -> DunningResult<()> {
        self.sequences.validate()?;
        if !self.sequences.contains(&self.default_sequence_id) {
            return Err(DunningError::UnknownSequence(self.default_sequence_id.clone()));
        }
        for (tier, sequence_id) in &self.tier_sequences {
            if !self.sequences.contains(sequence_id) {
                return Err(DunningError::InvalidConfig(format!(
                    "Tier '{}' maps to unknown sequence '{}'",
                    tier, sequence_id
                )));
            }
        }
        Ok(())
    }

    /// Sequence id for a customer tier, falling back to the default
    pub fn sequence_id_for_tier(&self, tier: Option<&str>) -> &str {
        tier.and_then(|t| self.tier_sequences.get(t))
            .map(String::as_str)
            .unwrap_or(self.default_sequence_id.as_str())
    }
}

/// Parses `tier=sequence,tier=sequence`
fn parse_tier_sequences(raw: &str) -> DunningResult<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (tier, sequence) = pair.split_once('=').ok_or_else(|| {
                DunningError::InvalidConfig(format!(
                    "DUNNING_TIER_SEQUENCES entry '{}' must look like tier=sequence",
                    pair
                ))
            })?;
            Ok((tier.trim().to_string(), sequence.trim().to_string()))
        })
        .collect()
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{AGGRESSIVE, LENIENT};

    #[test]
    fn test_parse_tier_sequences() {
        let map = parse_tier_sequences("free=aggressive, enterprise = lenient,").unwrap();
        assert_eq!(map.get("free").map(String::as_str), Some(AGGRESSIVE));
        assert_eq!(map.get("enterprise").map(String::as_str), Some(LENIENT));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_parse_tier_sequences_rejects_garbage() {
        let err = parse_tier_sequences("free:aggressive").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_tier_resolution_falls_back_to_default() {
        let config = DunningConfig::default().with_tier_sequence("enterprise", LENIENT);
        assert_eq!(config.sequence_id_for_tier(Some("enterprise")), LENIENT);
        assert_eq!(config.sequence_id_for_tier(Some("pro")), STANDARD_SAAS);
        assert_eq!(config.sequence_id_for_tier(None), STANDARD_SAAS);
    }

    #[test]
    fn test_validate_rejects_unknown_ids() {
        let config = DunningConfig::new(SequenceCatalog::builtin(), "nope");
        assert!(matches!(config.validate(), Err(DunningError::UnknownSequence(_))));

        let config = DunningConfig::default().with_tier_sequence("pro", "missing");
        assert!(matches!(config.validate(), Err(DunningError::InvalidConfig(_))));

        assert!(DunningConfig::default().validate().is_ok());
    }

    #[test]
    fn test_clock_override() {
        let fixed = time::macros::datetime!(2030-01-01 0:00 UTC);
        let config = DunningConfig::default().with_clock(Arc::new(move || fixed));
        assert_eq!(config.now(), fixed);
    }
}
