//! Retry Policy (§4.7): a pure function of attempt history to a retry decision.

use rand::Rng;

use crate::config::{Location, LocationMode};
use crate::error::ErrorKind;

/// Sum type over concrete retry policies (§4.7).
#[derive(Debug, Clone, Copy)]
pub enum RetryPolicy {
    ExponentialBackoff { base_ms: u64, min_ms: u64, max_ms: u64, max_attempts: u32 },
    LinearBackoff { step_ms: u64, max_attempts: u32 },
    None,
}

impl RetryPolicy {
    pub fn exponential_default() -> Self {
        RetryPolicy::ExponentialBackoff { base_ms: 3000, min_ms: 3000, max_ms: 120_000, max_attempts: 3 }
    }

    fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::ExponentialBackoff { max_attempts, .. } => *max_attempts,
            RetryPolicy::LinearBackoff { max_attempts, .. } => *max_attempts,
            RetryPolicy::None => 0,
        }
    }

    /// Computes the backoff delay for `attempt` (1-based), including jitter,
    /// capped at the policy's configured maximum (§4.7).
    fn delay_ms(&self, attempt: u32) -> u64 {
        match self {
            RetryPolicy::ExponentialBackoff { base_ms, min_ms, max_ms, .. } => {
                let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
                let jitter = rand::thread_rng().gen_range(0..=(*base_ms / 2).max(1));
                (exp + jitter).clamp(*min_ms, *max_ms)
            }
            RetryPolicy::LinearBackoff { step_ms, .. } => {
                let jitter = rand::thread_rng().gen_range(0..=(*step_ms / 2).max(1));
                step_ms.saturating_mul(attempt as u64) + jitter
            }
            RetryPolicy::None => 0,
        }
    }
}

/// Whether `kind`/`status` is eligible for retry at all, independent of
/// attempt count (§4.7, §7).
///
/// `after_lagging_write` marks a `404` observed immediately after a write-class
/// verb against a location that may not have caught up yet (§10.5).
pub fn is_retryable_kind(kind: ErrorKind, status: Option<u16>, after_lagging_write: bool) -> bool {
    if matches!(kind, ErrorKind::DeadlineExceeded | ErrorKind::AuthFailed) {
        return false;
    }
    if let Some(status) = status {
        if status == 501 || status == 505 {
            return false;
        }
        if status == 408 {
            return true;
        }
        if (500..600).contains(&status) {
            return true;
        }
        if status == 404 {
            return after_lagging_write;
        }
        if (400..500).contains(&status) {
            return false;
        }
    }
    matches!(
        kind,
        ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ServerBusy | ErrorKind::Throttled
    )
}

/// Result of evaluating the retry policy for one attempt (§4.3 "Retry integration").
#[derive(Debug, Clone, Copy)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_ms: u64,
    pub next_location_hint: Option<Location>,
}

impl RetryPolicy {
    /// Evaluates whether attempt number `attempt` (1-based, the attempt that
    /// just failed) should be retried, and the delay/location for the next one.
    pub fn evaluate(
        &self,
        attempt: u32,
        kind: ErrorKind,
        status: Option<u16>,
        after_lagging_write: bool,
        location_mode: LocationMode,
        current_location: Location,
    ) -> RetryDecision {
        let eligible = !matches!(self, RetryPolicy::None)
            && is_retryable_kind(kind, status, after_lagging_write)
            && attempt < self.max_attempts();

        if !eligible {
            return RetryDecision { retry: false, delay_ms: 0, next_location_hint: None };
        }

        RetryDecision {
            retry: true,
            delay_ms: self.delay_ms(attempt),
            next_location_hint: location_mode.next_location(current_location),
        }
    }
}
