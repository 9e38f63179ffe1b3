//! Bounded retries around a single request/response call.
//!
//! Only transport failures, timeouts and rejections the ledger marks as
//! retryable are retried. A cryptographic failure means the key or the data
//! is wrong and resending cannot fix it.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::FrameError;

#[derive(thiserror::Error, Debug)]
pub enum CallError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("rejected by peer: {reason}")]
    Rejected { reason: String, retryable: bool },
    #[error("unexpected response: expected {expected}, got {got}")]
    Unexpected { expected: &'static str, got: &'static str },
    #[error(transparent)]
    Crypto(#[from] sdrivecrypto::Error),
    #[error(transparent)]
    Offer(#[from] crate::owner::OfferError),
}

impl CallError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::Transport(_) | CallError::Timeout(_) => true,
            CallError::Rejected { retryable, .. } => *retryable,
            CallError::Unexpected { .. } | CallError::Crypto(_) | CallError::Offer(_) => false,
        }
    }
}

impl From<FrameError> for CallError {
    fn from(e: FrameError) -> Self {
        CallError::Transport(e.to_string())
    }
}

impl From<quinn::ConnectionError> for CallError {
    fn from(e: quinn::ConnectionError) -> Self {
        CallError::Transport(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub timeout: Duration,
    /// Delay after the first failure; doubles after each further one.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            timeout: Duration::from_secs(10),
            backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    /// Run `op` until it succeeds, fails permanently or the attempts run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(res) => res,
                Err(_) => Err(CallError::Timeout(self.timeout)),
            };
            match outcome {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(what, attempt, error = %e, ?delay, "call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
