//! Retry classification and backoff policy

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Why a request is being retried. Reasons accumulate on the request, one per
/// attempt, and are surfaced in the final error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
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
    CircuitBreakerOpen,
    QueryIndexNotFound,
    QueryPreparedStatementFailure,
    AnalyticsTemporaryFailure,
    SearchTooManyRequests,
    ViewsTemporaryFailure,
    ViewsNoActivePartition,
    DoNotRetry,
}

impl RetryReason {
    /// Reasons that are retried even for non-idempotent requests.
    pub fn allows_non_idempotent_retry(self) -> bool {
        matches!(
            self,
            RetryReason::SocketNotAvailable
                | RetryReason::ServiceNotAvailable
                | RetryReason::NodeNotAvailable
                | RetryReason::KvNotMyVbucket
                | RetryReason::KvCollectionOutdated
                | RetryReason::KvErrorMapRetryIndicated
                | RetryReason::KvLocked
                | RetryReason::KvTemporaryFailure
                | RetryReason::KvSyncWriteInProgress
                | RetryReason::KvSyncWriteReCommitInProgress
                | RetryReason::ServiceResponseCodeIndicated
                | RetryReason::CircuitBreakerOpen
                | RetryReason::QueryIndexNotFound
                | RetryReason::QueryPreparedStatementFailure
                | RetryReason::AnalyticsTemporaryFailure
                | RetryReason::SearchTooManyRequests
                | RetryReason::ViewsTemporaryFailure
                | RetryReason::ViewsNoActivePartition
        )
    }

    /// Reasons that are retried unconditionally, bypassing the strategy.
    /// These indicate the client's own view of the cluster is stale, so the
    /// retry cannot double-apply anything.
    pub fn always_retry(self) -> bool {
        matches!(
            self,
            RetryReason::KvNotMyVbucket
                | RetryReason::KvCollectionOutdated
                | RetryReason::ViewsNoActivePartition
        )
    }
}

impl RetryReason {
    /// Stable snake_case name, matching the JSON error context spelling
    pub fn as_str(self) -> &'static str {
        match self {
            RetryReason::Unknown => "unknown",
            RetryReason::SocketNotAvailable => "socket_not_available",
            RetryReason::ServiceNotAvailable => "service_not_available",
            RetryReason::NodeNotAvailable => "node_not_available",
            RetryReason::KvNotMyVbucket => "kv_not_my_vbucket",
            RetryReason::KvCollectionOutdated => "kv_collection_outdated",
            RetryReason::KvErrorMapRetryIndicated => "kv_error_map_retry_indicated",
            RetryReason::KvLocked => "kv_locked",
            RetryReason::KvTemporaryFailure => "kv_temporary_failure",
            RetryReason::KvSyncWriteInProgress => "kv_sync_write_in_progress",
            RetryReason::KvSyncWriteReCommitInProgress => "kv_sync_write_re_commit_in_progress",
            RetryReason::ServiceResponseCodeIndicated => "service_response_code_indicated",
            RetryReason::SocketClosedWhileInFlight => "socket_closed_while_in_flight",
            RetryReason::CircuitBreakerOpen => "circuit_breaker_open",
            RetryReason::QueryIndexNotFound => "query_index_not_found",
            RetryReason::QueryPreparedStatementFailure => "query_prepared_statement_failure",
            RetryReason::AnalyticsTemporaryFailure => "analytics_temporary_failure",
            RetryReason::SearchTooManyRequests => "search_too_many_requests",
            RetryReason::ViewsTemporaryFailure => "views_temporary_failure",
            RetryReason::ViewsNoActivePartition => "views_no_active_partition",
            RetryReason::DoNotRetry => "do_not_retry",
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controlled backoff table: monotone, capped at one second.
pub fn controlled_backoff(retry_attempts: u32) -> Duration {
    Duration::from_millis(match retry_attempts {
        0 => 1,
        1 => 10,
        2 => 50,
        3 => 100,
        4 => 500,
        _ => 1_000,
    })
}

/// Computes the sleep before attempt `retry_attempts + 1`.
pub type BackoffCalculator = Box<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff calculator `min * factor^attempt`, clamped to
/// `[min, max]`. Non-positive parameters fall back to the defaults
/// `(1ms, 500ms, 2.0)`.
pub fn exponential_backoff(min: Duration, max: Duration, factor: f64) -> BackoffCalculator {
    let min_ms = if min > Duration::ZERO { min.as_millis() as f64 } else { 1.0 };
    let max_ms = if max > Duration::ZERO { max.as_millis() as f64 } else { 500.0 };
    let factor = if factor > 0.0 { factor } else { 2.0 };

    Box::new(move |retry_attempts| {
        let backoff = (min_ms * factor.powi(retry_attempts as i32)).clamp(min_ms, max_ms);
        Duration::from_millis(backoff as u64)
    })
}

/// Outcome of consulting a retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAction {
    duration: Option<Duration>,
}

impl RetryAction {
    pub fn retry_after(duration: Duration) -> Self {
        Self { duration: Some(duration) }
    }

    pub fn do_not_retry() -> Self {
        Self { duration: None }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.duration
    }
}

/// Mutable retry bookkeeping carried by every pending request.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    attempts: u32,
    reasons: Vec<RetryReason>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one retry attempt and the reason that triggered it
    pub fn record(&mut self, reason: RetryReason) {
        self.attempts += 1;
        self.reasons.push(reason);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reasons(&self) -> &[RetryReason] {
        &self.reasons
    }
}

/// Best-effort strategy: retry whenever the reason (or the request's
/// idempotence) permits, sleeping per the configured calculator.
pub struct BestEffortRetryStrategy {
    calculator: BackoffCalculator,
}

impl BestEffortRetryStrategy {
    pub fn new(calculator: BackoffCalculator) -> Self {
        Self { calculator }
    }

    /// Default strategy: controlled backoff table
    pub fn controlled() -> Self {
        Self::new(Box::new(controlled_backoff))
    }

    pub fn retry_after(&self, state: &RetryState, idempotent: bool, reason: RetryReason) -> RetryAction {
        if idempotent || reason.allows_non_idempotent_retry() {
            return RetryAction::retry_after((self.calculator)(state.attempts()));
        }
        RetryAction::do_not_retry()
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self::controlled()
    }
}

impl fmt::Debug for BestEffortRetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BestEffortRetryStrategy").finish_non_exhaustive()
    }
}

/// Decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep this long, then try again
    RetryAfter(Duration),
    /// Surface the failure to the caller
    GiveUp,
    /// The deadline would elapse before (or during) the backoff
    DeadlineExceeded,
}

/// Pure orchestration rule: always-retry reasons bypass the strategy, the
/// strategy arbitrates everything else, and the absolute deadline caps both.
/// Retries never reset the deadline.
pub fn orchestrate(
    strategy: &BestEffortRetryStrategy,
    state: &RetryState,
    idempotent: bool,
    reason: RetryReason,
    deadline: Instant,
) -> RetryDecision {
    let action = if reason.always_retry() {
        RetryAction::retry_after(controlled_backoff(state.attempts()))
    } else {
        strategy.retry_after(state, idempotent, reason)
    };

    match action.delay() {
        None => RetryDecision::GiveUp,
        Some(delay) => {
            if Instant::now() + delay >= deadline {
                RetryDecision::DeadlineExceeded
            } else {
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controlled_backoff_table() {
        let expected = [1u64, 10, 50, 100, 500];
        for (attempt, ms) in expected.iter().enumerate() {
            assert_eq!(controlled_backoff(attempt as u32), Duration::from_millis(*ms));
        }
        assert_eq!(controlled_backoff(5), Duration::from_millis(1_000));
        assert_eq!(controlled_backoff(100), Duration::from_millis(1_000));
    }

    #[test]
    fn exponential_backoff_clamps_to_bounds() {
        let calc = exponential_backoff(Duration::from_millis(1), Duration::from_millis(500), 2.0);
        assert_eq!(calc(0), Duration::from_millis(1));
        assert_eq!(calc(1), Duration::from_millis(2));
        assert_eq!(calc(8), Duration::from_millis(256));
        assert_eq!(calc(9), Duration::from_millis(500));
        assert_eq!(calc(30), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_defaults_on_zero_params() {
        let calc = exponential_backoff(Duration::ZERO, Duration::ZERO, 0.0);
        assert_eq!(calc(0), Duration::from_millis(1));
        assert_eq!(calc(20), Duration::from_millis(500));
    }

    #[test]
    fn always_retry_set_is_exactly_the_stale_view_reasons() {
        for reason in [
            RetryReason::KvNotMyVbucket,
            RetryReason::KvCollectionOutdated,
            RetryReason::ViewsNoActivePartition,
        ] {
            assert!(reason.always_retry());
        }
        assert!(!RetryReason::KvTemporaryFailure.always_retry());
        assert!(!RetryReason::DoNotRetry.always_retry());
        assert!(!RetryReason::SocketClosedWhileInFlight.always_retry());
    }

    #[test]
    fn non_idempotent_retry_rejected_for_in_flight_socket_close() {
        let strategy = BestEffortRetryStrategy::controlled();
        let state = RetryState::new();
        let action = strategy.retry_after(&state, false, RetryReason::SocketClosedWhileInFlight);
        assert_eq!(action.delay(), None);
        let action = strategy.retry_after(&state, true, RetryReason::SocketClosedWhileInFlight);
        assert_eq!(action.delay(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn reasons_accumulate_one_per_attempt() {
        let mut state = RetryState::new();
        state.record(RetryReason::KvNotMyVbucket);
        state.record(RetryReason::KvTemporaryFailure);
        state.record(RetryReason::KvNotMyVbucket);
        assert_eq!(state.attempts(), 3);
        assert_eq!(state.reasons().len(), 3);
    }
}
