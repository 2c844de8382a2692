//! Outbound transport contract, retry classification, and the resilience
//! primitives (circuit breakers, concurrency governor, resilient caller) for RDC.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Method, StatusCode};
use thiserror::Error;

pub mod breaker;
pub mod caller;
pub mod cancel;
pub mod governor;

pub use breaker::{BreakerConfig, CircuitBreakerRegistry, CircuitSnapshot};
pub use caller::{CallContext, CallError, CallSuccess, ResilientCaller};
pub use cancel::RunCancel;
pub use governor::{ConcurrencyGovernor, GovernorConfig, GovernorError, Slot, TokenBucketConfig};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// One outbound request. The idempotency key is identical on every attempt of a
/// logical call.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub destination: String,
    pub url: Option<String>,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("no endpoint configured for destination {0}")]
    NoEndpoint(String),
    #[error("request failed: {0}")]
    Request(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() || err.is_request() {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Request(err.to_string())
        }
    }
}

/// Request/response exchange with a downstream destination.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_transport_error(err: &TransportError) -> RetryDisposition {
    match err {
        TransportError::Timeout | TransportError::Connect(_) => RetryDisposition::Retryable,
        TransportError::NoEndpoint(_) | TransportError::Request(_) => {
            RetryDisposition::NonRetryable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// `base × 2^(attempt−1)` for a 1-based attempt number, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Exponential delay plus uniform jitter in `0..=jitter`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.delay_for_attempt(attempt) + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Destination class key (`email`, `sms`, `platform:reddit`, ...) to endpoint URL.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            endpoints: BTreeMap::new(),
        }
    }
}

/// reqwest-backed transport that posts JSON payloads to per-destination endpoints.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: BTreeMap<String, String>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoints: config.endpoints,
        })
    }

    fn resolve_url<'a>(&'a self, request: &'a OutboundRequest) -> Option<&'a str> {
        request
            .url
            .as_deref()
            .or_else(|| self.endpoints.get(&request.destination).map(String::as_str))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let url = self
            .resolve_url(request)
            .ok_or_else(|| TransportError::NoEndpoint(request.destination.clone()))?;

        let resp = self
            .client
            .request(request.method.clone(), url)
            .header(IDEMPOTENCY_HEADER, &request.idempotency_key)
            .json(&request.payload)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.bytes().await?.to_vec();
        Ok(OutboundResponse { status, body })
    }
}
