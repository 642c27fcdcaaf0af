//! Reqwest client for the external accrual system.
//!
//! Transport failures are retried a bounded number of times; any response that
//! arrives is final for this call, whatever its status.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::{header::RETRY_AFTER, Client, StatusCode, Url};
use tracing::{debug, warn};

use super::models::{AccrualError, OrderAccrual};
use super::AccrualService;

/// Accrual client configuration.
#[derive(Debug, Clone)]
pub struct AccrualClientConfig {
    /// Base address of the accrual system, e.g. `http://localhost:8080`.
    pub base_url: String,

    /// Per-attempt request timeout.
    pub timeout: Duration,

    /// Total attempts per call, including the first one.
    pub max_attempts: usize,

    /// Delay before the first retry; doubles on each further retry.
    pub retry_delay: Duration,
}

impl Default for AccrualClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            timeout: Duration::from_secs(2),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

pub struct AccrualClient {
    client: Client,
    base_url: Url,
    max_attempts: usize,
    retry_delay: Duration,
}

impl AccrualClient {
    pub fn new(config: AccrualClientConfig) -> Result<Self, AccrualError> {
        let base_url = parse_base_url(&config.base_url)?;
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AccrualError::Transport {
                attempts: 0,
                source: e,
            })?;

        Ok(Self {
            client,
            base_url,
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
        })
    }

    /// `<base>/api/orders/{number}`, with the number percent-encoded as a
    /// single path segment.
    pub fn order_url(&self, order_number: &str) -> Result<Url, AccrualError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AccrualError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "orders", order_number]);
        Ok(url)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(self.retry_delay * 4)
            .with_max_times(self.max_attempts - 1)
    }

    fn retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(RETRY_AFTER)?
            .to_str()
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl AccrualService for AccrualClient {
    async fn check_order(&self, order_number: &str) -> Result<OrderAccrual, AccrualError> {
        let url = self.order_url(order_number)?;
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;
        let client = &self.client;

        let response = (|| {
            let url = url.clone();
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
                client.get(url).send().await
            }
        })
        .retry(self.backoff())
        .notify(|err: &reqwest::Error, delay: Duration| {
            warn!(order_number, error = %err, ?delay, "Accrual request failed, retrying");
        })
        .await
        .map_err(|source| AccrualError::Transport {
            attempts: attempts.load(Ordering::Relaxed),
            source,
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            let retry_after = Self::retry_after(&response);
            debug!(order_number, %status, ?retry_after, "Accrual service did not return a result");
            return Err(AccrualError::UnexpectedStatus {
                status: status.as_u16(),
                retry_after,
            });
        }

        let body = response.bytes().await.map_err(|e| AccrualError::Transport {
            attempts: attempts.load(Ordering::Relaxed),
            source: e,
        })?;

        serde_json::from_slice::<OrderAccrual>(&body).map_err(|e| AccrualError::Decode(e.to_string()))
    }
}

/// Accept bare `host:port` addresses as well as full URLs.
fn parse_base_url(raw: &str) -> Result<Url, AccrualError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };

    let url = Url::parse(&with_scheme).map_err(|e| AccrualError::InvalidUrl(format!("{raw}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(AccrualError::InvalidUrl(raw.to_string()));
    }
    Ok(url)
}
