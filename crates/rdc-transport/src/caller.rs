//! Breaker-aware outbound calls with classified retries.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::breaker::CircuitBreakerRegistry;
use crate::cancel::RunCancel;
use crate::{
    classify_status, classify_transport_error, BackoffPolicy, OutboundRequest, RetryDisposition,
    Transport, TransportError,
};

#[derive(Debug, Clone)]
pub struct CallContext {
    pub run_id: Uuid,
    pub cancel: RunCancel,
}

#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub status: StatusCode,
    pub attempts: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("circuit open for {destination}")]
    CircuitOpen { destination: String },
    #[error("{destination} rejected the call with status {status} after {attempts} attempt(s)")]
    Rejected {
        destination: String,
        status: u16,
        attempts: u32,
    },
    #[error("{destination} transport error after {attempts} attempt(s): {message}")]
    Transport {
        destination: String,
        message: String,
        attempts: u32,
    },
    #[error("retries exhausted for {destination} after {attempts} attempt(s): {last}")]
    Exhausted {
        destination: String,
        attempts: u32,
        last: String,
    },
    #[error("call to {destination} cancelled after {attempts} attempt(s)")]
    Cancelled { destination: String, attempts: u32 },
}

impl CallError {
    pub fn attempts(&self) -> u32 {
        match self {
            CallError::CircuitOpen { .. } => 0,
            CallError::Rejected { attempts, .. }
            | CallError::Transport { attempts, .. }
            | CallError::Exhausted { attempts, .. }
            | CallError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CallError::CircuitOpen { .. } => "circuit_open",
            CallError::Rejected { .. } => "rejected",
            CallError::Transport { .. } => "transport",
            CallError::Exhausted { .. } => "exhausted",
            CallError::Cancelled { .. } => "cancelled",
        }
    }

    /// Terminal failures count against the destination; circuit-open and
    /// cancellation do not.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            CallError::Rejected { .. } | CallError::Transport { .. } | CallError::Exhausted { .. }
        )
    }
}

enum AttemptFailure {
    Retryable(String),
    Terminal(CallError),
}

pub struct ResilientCaller {
    transport: Arc<dyn Transport>,
    breakers: Arc<CircuitBreakerRegistry>,
    backoff: BackoffPolicy,
    call_timeout: Duration,
}

impl ResilientCaller {
    pub fn new(
        transport: Arc<dyn Transport>,
        breakers: Arc<CircuitBreakerRegistry>,
        backoff: BackoffPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            breakers,
            backoff,
            call_timeout,
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.backoff.max_attempts
    }

    /// Issue one logical call to `request.destination`, retrying classified
    /// transient failures up to `max_attempts` tries.
    pub async fn call(
        &self,
        ctx: &CallContext,
        request: &OutboundRequest,
        max_attempts: u32,
    ) -> Result<CallSuccess, CallError> {
        let span = info_span!(
            "dispatch_call",
            run_id = %ctx.run_id,
            destination = %request.destination,
            idempotency_key = %request.idempotency_key,
        );
        self.call_inner(ctx, request, max_attempts.max(1))
            .instrument(span)
            .await
    }

    async fn call_inner(
        &self,
        ctx: &CallContext,
        request: &OutboundRequest,
        max_attempts: u32,
    ) -> Result<CallSuccess, CallError> {
        let run_id = ctx.run_id;
        let destination = request.destination.as_str();

        if !self.breakers.can_call(destination).await {
            warn!(event = "dispatch_attempt", %run_id, destination, attempt = 0u32, outcome = "circuit_open");
            return Err(CallError::CircuitOpen {
                destination: destination.to_string(),
            });
        }

        let mut attempt = 0u32;
        loop {
            if ctx.cancel.is_cancelled() {
                warn!(event = "dispatch_attempt", %run_id, destination, attempt, outcome = "cancelled");
                return Err(CallError::Cancelled {
                    destination: destination.to_string(),
                    attempts: attempt,
                });
            }
            attempt += 1;

            let sent = match tokio::time::timeout(self.call_timeout, self.transport.send(request)).await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout),
            };

            let failure = match sent {
                Ok(resp) if resp.status.is_success() => {
                    self.breakers.record_success(destination).await;
                    info!(
                        event = "dispatch_attempt",
                        %run_id,
                        destination,
                        attempt,
                        outcome = "success",
                        status = resp.status.as_u16()
                    );
                    return Ok(CallSuccess {
                        status: resp.status,
                        attempts: attempt,
                        body: resp.body,
                    });
                }
                Ok(resp) => match classify_status(resp.status) {
                    RetryDisposition::Retryable => {
                        AttemptFailure::Retryable(format!("status {}", resp.status.as_u16()))
                    }
                    RetryDisposition::NonRetryable => AttemptFailure::Terminal(CallError::Rejected {
                        destination: destination.to_string(),
                        status: resp.status.as_u16(),
                        attempts: attempt,
                    }),
                },
                Err(err) => match classify_transport_error(&err) {
                    RetryDisposition::Retryable => AttemptFailure::Retryable(err.to_string()),
                    RetryDisposition::NonRetryable => {
                        AttemptFailure::Terminal(CallError::Transport {
                            destination: destination.to_string(),
                            message: err.to_string(),
                            attempts: attempt,
                        })
                    }
                },
            };

            let error = match failure {
                AttemptFailure::Terminal(error) => error,
                AttemptFailure::Retryable(last) if attempt >= max_attempts => CallError::Exhausted {
                    destination: destination.to_string(),
                    attempts: attempt,
                    last,
                },
                AttemptFailure::Retryable(last) => {
                    let delay = self.backoff.jittered_delay(attempt);
                    warn!(
                        event = "dispatch_attempt",
                        %run_id,
                        destination,
                        attempt,
                        outcome = "retry_scheduled",
                        delay_ms = delay.as_millis() as u64,
                        reason = %last
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {
                            warn!(event = "dispatch_attempt", %run_id, destination, attempt, outcome = "cancelled");
                            return Err(CallError::Cancelled {
                                destination: destination.to_string(),
                                attempts: attempt,
                            });
                        }
                    }
                    continue;
                }
            };

            let tripped = self.breakers.record_failure(destination).await;
            warn!(
                event = "dispatch_attempt",
                %run_id,
                destination,
                attempt,
                outcome = "failure",
                reason = error.reason(),
                circuit_opened = tripped,
                error = %error
            );
            return Err(error);
        }
    }
}
