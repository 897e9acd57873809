//! Retry reasons, strategies, and the orchestrator

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::binary::request::QueueRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetryReason {
    DoNotRetry,
    Unknown,
    SocketNotAvailable,
    ServiceNotAvailable,
    NodeNotAvailable,
    KvNotMyVbucket,
    KvCollectionOutdated,
    KvErrorMapRetryIndicated,
    KvLocked,
    KvTemporaryFailure,
    KvSyncWriteInProgress,
    KvSyncWriteReCommitInProgress,
    ServiceResponseCodeIndicated,
    SocketClosedWhileInFlight,
    ViewsNoActivePartition,
}

impl RetryReason {
    /// Reasons safe to retry even for non-idempotent commands.
    pub fn allows_non_idempotent_retry(self) -> bool {
        !matches!(
            self,
            RetryReason::DoNotRetry | RetryReason::SocketClosedWhileInFlight | RetryReason::Unknown
        )
    }

    /// Reasons retried unconditionally, bypassing the request's strategy.
    pub fn always_retry(self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket
                | RetryReason::KvCollectionOutdated
                | RetryReason::ViewsNoActivePartition
        )
    }
}

/// Outcome of a retry decision: either "do not retry" or a backoff duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAction {
    duration: Option<Duration>,
}

impl RetryAction {
    pub fn with_duration(duration: Duration) -> RetryAction {
        RetryAction { duration: Some(duration) }
    }

    pub fn do_not_retry() -> RetryAction {
        RetryAction { duration: None }
    }

    pub fn need_to_retry(&self) -> bool {
        self.duration.is_some()
    }

    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or(Duration::ZERO)
    }
}

pub trait RetryStrategy: Send + Sync + std::fmt::Debug {
    fn retry_after(&self, request: &QueueRequest, reason: RetryReason) -> RetryAction;
}

pub type BackoffCalculator = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Fixed schedule used for the always-retry reasons.
pub fn controlled_backoff(retry_attempts: u32) -> Duration {
    match retry_attempts {
        0 => Duration::from_millis(1),
        1 => Duration::from_millis(10),
        2 => Duration::from_millis(50),
        3 => Duration::from_millis(100),
        4 => Duration::from_millis(500),
        _ => Duration::from_millis(1000),
    }
}

/// Exponential `min * factor^n` clamped to `[min, max]`.
pub fn exponential_backoff(
    min_backoff: Duration,
    max_backoff: Duration,
    backoff_factor: f64,
) -> BackoffCalculator {
    Arc::new(move |retry_attempts| {
        let backoff =
            min_backoff.as_millis() as f64 * backoff_factor.powi(retry_attempts as i32);
        let clamped = backoff.min(max_backoff.as_millis() as f64).max(min_backoff.as_millis() as f64);
        Duration::from_millis(clamped as u64)
    })
}

/// Retries any reason that permits it (by idempotency) with a calculated
/// backoff. This is the default strategy for every request.
#[derive(Clone)]
pub struct BestEffortRetryStrategy {
    calculator: BackoffCalculator,
}

impl std::fmt::Debug for BestEffortRetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("best_effort_retry_strategy")
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        BestEffortRetryStrategy {
            calculator: exponential_backoff(
                Duration::from_millis(1),
                Duration::from_millis(500),
                2.0,
            ),
        }
    }
}

impl BestEffortRetryStrategy {
    pub fn new(calculator: BackoffCalculator) -> BestEffortRetryStrategy {
        BestEffortRetryStrategy { calculator }
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn retry_after(&self, request: &QueueRequest, reason: RetryReason) -> RetryAction {
        if request.idempotent() || reason.allows_non_idempotent_retry() {
            return RetryAction::with_duration((self.calculator)(request.retry_attempts()));
        }
        RetryAction::do_not_retry()
    }
}

/// Never retries. Useful for callers that prefer failing fast.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn retry_after(&self, _request: &QueueRequest, _reason: RetryReason) -> RetryAction {
        RetryAction::do_not_retry()
    }
}

/// Uniform retry decision across request types.
pub mod orchestrator {
    use super::*;

    pub fn should_retry(request: &Arc<QueueRequest>, reason: RetryReason) -> RetryAction {
        if reason.always_retry() {
            let duration = controlled_backoff(request.retry_attempts());
            debug!(
                backoff_ms = duration.as_millis() as u64,
                operation_id = %request.identifier(),
                ?reason,
                "will retry request"
            );
            request.record_retry_attempt(reason);
            return RetryAction::with_duration(duration);
        }

        let Some(strategy) = request.retry_strategy.clone() else {
            return RetryAction::do_not_retry();
        };

        let action = strategy.retry_after(request, reason);
        if !action.need_to_retry() {
            debug!(operation_id = %request.identifier(), ?reason, "will not retry request");
            return RetryAction::do_not_retry();
        }
        debug!(
            backoff_ms = action.duration().as_millis() as u64,
            operation_id = %request.identifier(),
            ?reason,
            "will retry request"
        );
        request.record_retry_attempt(reason);
        action
    }
}
