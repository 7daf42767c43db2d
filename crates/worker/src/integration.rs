//! HTTP bridge for dunning callbacks
//!
//! Every side effect the core asks for is POSTed as JSON to the billing
//! integration service. Idempotent calls (access, cancel, notification,
//! events, customer lookup) are retried with exponential backoff on transport
//! errors, 429 and 5xx. Payment retries go out exactly once: a timeout there
//! may still have charged the card.

use std::time::Duration;

use async_trait::async_trait;
use dunning::{
    AccessController, AccessLevel, CustomerDirectory, CustomerSnapshot, DunningError,
    DunningEvent, DunningEventHandler, DunningNotification, DunningResult, NotificationResult,
    Notifier, PaymentRetrier, RetryOutcome, StepExecutionContext, SubscriptionCanceller,
};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum CallError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("invalid response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl CallError {
    fn is_retryable(&self) -> bool {
        match self {
            CallError::Transport { .. } => true,
            CallError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            CallError::Decode { .. } => false,
        }
    }
}

impl From<CallError> for DunningError {
    fn from(err: CallError) -> Self {
        DunningError::Callback(err.to_string())
    }
}

#[derive(Serialize)]
struct PaymentRetryRequest<'a> {
    dunning_state_id: Uuid,
    customer_id: &'a str,
    subscription_id: &'a str,
    step_id: &'a str,
    amount_cents: i64,
    currency: &'a str,
    attempt: u32,
}

#[derive(Serialize)]
struct AccessRequest<'a> {
    customer_id: &'a str,
    access_level: AccessLevel,
}

#[derive(Serialize)]
struct CancelRequest<'a> {
    subscription_id: &'a str,
    reason: &'a str,
}

#[derive(Clone)]
pub struct HttpIntegration {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    max_retries: usize,
    /// Multiplier in milliseconds for the 2^n backoff
    backoff_factor_ms: u64,
}

impl HttpIntegration {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        max_retries: usize,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = Url::parse(&base_url.into())?;
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "Integration URL {} cannot carry a path",
            base_url
        );
        Ok(Self {
            client,
            base_url,
            api_key,
            max_retries,
            backoff_factor_ms: 100,
        })
    }

    #[cfg(test)]
    fn with_backoff_factor_ms(mut self, factor: u64) -> Self {
        self.backoff_factor_ms = factor;
        self
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.backoff_factor_ms)
            .max_delay(MAX_BACKOFF)
            .map(jitter)
            .take(self.max_retries)
    }

    /// Base URL with each segment appended percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn post_once<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response, CallError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let response = self
            .request(Method::POST, self.endpoint(&segments))
            .json(body)
            .send()
            .await
            .map_err(|source| CallError::Transport {
                path: path.to_string(),
                source,
            })?;
        check_status(path, response).await
    }

    async fn post_idempotent<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, CallError> {
        RetryIf::spawn(
            self.backoff(),
            || self.post_once(path, body),
            |e: &CallError| {
                let retry = e.is_retryable();
                if retry {
                    tracing::warn!(path = %path, error = %e, "Integration call failed, retrying");
                }
                retry
            },
        )
        .await
    }

    async fn get_customer_once(&self, customer_id: &str) -> Result<Option<CustomerSnapshot>, CallError> {
        let url = self.endpoint(&["customers", customer_id]);
        let path = url.path().to_string();
        let response = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|source| CallError::Transport {
                path: path.to_string(),
                source,
            })?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(&path, response).await?;
        let customer = response.json().await.map_err(|source| CallError::Decode {
            path: path.to_string(),
            source,
        })?;
        Ok(Some(customer))
    }
}

async fn check_status(path: &str, response: Response) -> Result<Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CallError::Status {
        path: path.to_string(),
        status,
        body,
    })
}

#[async_trait]
impl PaymentRetrier for HttpIntegration {
    async fn retry_payment(&self, context: &StepExecutionContext) -> DunningResult<RetryOutcome> {
        let path = "/payments/retry";
        let request = PaymentRetryRequest {
            dunning_state_id: context.state_id,
            customer_id: &context.customer.id,
            subscription_id: &context.subscription_id,
            step_id: &context.step_id,
            amount_cents: context.amount_owed_cents,
            currency: &context.currency,
            attempt: context.total_retry_attempts + 1,
        };

        let response = self.post_once(path, &request).await?;
        let outcome: RetryOutcome = response.json().await.map_err(|source| CallError::Decode {
            path: path.to_string(),
            source,
        })?;
        Ok(outcome)
    }
}

#[async_trait]
impl AccessController for HttpIntegration {
    async fn update_access(&self, customer_id: &str, level: AccessLevel) -> DunningResult<()> {
        self.post_idempotent(
            "/access",
            &AccessRequest {
                customer_id,
                access_level: level,
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionCanceller for HttpIntegration {
    async fn cancel_subscription(&self, subscription_id: &str, reason: &str) -> DunningResult<()> {
        self.post_idempotent(
            "/subscriptions/cancel",
            &CancelRequest {
                subscription_id,
                reason,
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for HttpIntegration {
    async fn send(&self, notification: &DunningNotification) -> DunningResult<NotificationResult> {
        match self.post_idempotent("/notifications", notification).await {
            Ok(_) => Ok(NotificationResult::delivered(notification.channel)),
            // Rejected by the provider: report, don't fail the step action
            Err(CallError::Status { status, body, .. }) if status.is_client_error() => Ok(
                NotificationResult::failed(notification.channel, format!("{}: {}", status, body)),
            ),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CustomerDirectory for HttpIntegration {
    async fn get_customer(&self, customer_id: &str) -> DunningResult<Option<CustomerSnapshot>> {
        let customer = RetryIf::spawn(
            self.backoff(),
            || self.get_customer_once(customer_id),
            CallError::is_retryable,
        )
        .await?;
        Ok(customer)
    }
}

#[async_trait]
impl DunningEventHandler for HttpIntegration {
    async fn handle(&self, event: &DunningEvent) -> DunningResult<()> {
        self.post_idempotent("/events", event).await?;
        Ok(())
    }
}
