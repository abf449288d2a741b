//! Fixed window admission decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::counter::{to_chrono, CounterRecord};
use super::key::KeyGenerator;
use super::store::CounterStore;
use crate::clock::{self, Clock};

/// How to decide when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request and report a full quota
    #[default]
    Open,
    /// Deny the request until the window would have elapsed
    Closed,
}

/// Shortest window a policy will count over.
pub const MIN_WINDOW: Duration = Duration::from_millis(1);

/// A quota applied to one key.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Length of each fixed window
    pub window: Duration,
    /// Requests admitted per window (at least 1)
    pub max_requests: u64,
    /// Maps a request to the key its quota is counted under
    pub key_generator: KeyGenerator,
}

impl RateLimitPolicy {
    /// Create a policy keyed by the default constant key.
    ///
    /// A `max_requests` of zero is raised to one and a window shorter than
    /// [`MIN_WINDOW`] is raised to it.
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            max_requests: max_requests.max(1),
            key_generator: KeyGenerator::default(),
        }
    }

    /// The enforced limit, at least 1 even for hand-built policies.
    pub fn limit(&self) -> u64 {
        self.max_requests.max(1)
    }

    /// The enforced window, at least [`MIN_WINDOW`] even for hand-built policies.
    pub fn window_len(&self) -> Duration {
        self.window.max(MIN_WINDOW)
    }

    /// Use the given key generator.
    pub fn keyed_by(mut self, key_generator: KeyGenerator) -> Self {
        self.key_generator = key_generator;
        self
    }
}

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The configured maximum per window
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
    /// Seconds to wait before retrying; set only on denial
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn admitted(record: &CounterRecord, limit: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit.saturating_sub(record.count),
            reset_time: record.reset_time,
            retry_after_secs: None,
        }
    }

    fn denied(record: &CounterRecord, limit: u64, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_time: record.reset_time,
            retry_after_secs: Some(record.retry_after_secs(now)),
        }
    }

    /// Reset time as unix seconds, floored.
    pub fn reset_unix_secs(&self) -> i64 {
        self.reset_time.timestamp()
    }
}

/// Admission controller over a counter store.
///
/// The limiter keeps no state of its own; every decision is a single
/// atomic acquisition against the store.
pub struct RateLimiter<S: CounterStore + ?Sized> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
}

impl<S: CounterStore + ?Sized> RateLimiter<S> {
    /// Create a fail-open limiter on the system clock.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            clock: clock::system(),
            failure_mode: FailureMode::default(),
        }
    }

    /// Use the given clock for retry-after and fallback windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Choose how store failures are decided.
    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Check and count one request for `key` under `policy`.
    ///
    /// Exactly `max_requests` checks are admitted per window; denials do not
    /// touch the counter.
    pub async fn check(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let limit = policy.limit();
        let window = policy.window_len();

        trace!(key = %key, limit = limit, window_ms = window.as_millis() as u64, "Checking rate limit");

        let acquisition = match self.store.acquire(key, window, limit).await {
            Ok(acquisition) => acquisition,
            Err(e) => return self.on_store_failure(key, policy, &e),
        };

        if acquisition.admitted {
            if acquisition.record.count == 1 {
                debug!(key = %key, reset_time = %acquisition.record.reset_time, "Opened new rate limit window");
            }
            RateLimitDecision::admitted(&acquisition.record, limit)
        } else {
            debug!(key = %key, count = acquisition.record.count, limit = limit, "Rate limit exceeded");
            RateLimitDecision::denied(&acquisition.record, limit, self.clock.now())
        }
    }

    /// Check several quotas in order, e.g. per API key, per org and per endpoint.
    ///
    /// Returns the first denial. When every check passes, the first decision
    /// is returned with `remaining` lowered to the tightest quota.
    pub async fn check_all(&self, checks: &[(&str, &RateLimitPolicy)]) -> Option<RateLimitDecision> {
        let mut combined: Option<RateLimitDecision> = None;

        for (key, policy) in checks {
            let decision = self.check(key, policy).await;
            if !decision.allowed {
                return Some(decision);
            }

            combined = Some(match combined {
                None => decision,
                Some(mut first) => {
                    first.remaining = first.remaining.min(decision.remaining);
                    first
                }
            });
        }

        combined
    }

    fn on_store_failure(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
        error: &super::StoreError,
    ) -> RateLimitDecision {
        let now = self.clock.now();
        let limit = policy.limit();
        let reset_time = now
            .checked_add_signed(to_chrono(policy.window_len()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        warn!(
            key = %key,
            error = %error,
            failure_mode = ?self.failure_mode,
            "Counter store failed, applying failure mode"
        );

        match self.failure_mode {
            FailureMode::Open => RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit.saturating_sub(1),
                reset_time,
                retry_after_secs: None,
            },
            FailureMode::Closed => {
                let record = CounterRecord {
                    count: limit,
                    reset_time,
                };
                RateLimitDecision::denied(&record, limit, now)
            }
        }
    }
}
