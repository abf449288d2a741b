//! Entitlement gate decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::policy::{PolicyDocument, StrategyMode, TrialType};
use super::trace::{DecisionKind, DecisionObserver, DecisionTrace, GateRule, TracingObserver};
use crate::clock::{self, Clock};

/// A snapshot of what is known about a user's subscription and trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGateState {
    pub install_date: DateTime<Utc>,
    #[serde(default)]
    pub trial_end_date: Option<DateTime<Utc>>,
    pub is_premium: bool,
    /// Authoritative when set; takes precedence over `trial_end_date`
    #[serde(default)]
    pub is_trial_expired: Option<bool>,
    #[serde(default)]
    pub usage_hours: Option<f64>,
    #[serde(default)]
    pub session_count: Option<u64>,
}

impl UserGateState {
    /// A non-premium user who installed at `install_date`, with nothing else known.
    pub fn new(install_date: DateTime<Utc>) -> Self {
        Self {
            install_date,
            trial_end_date: None,
            is_premium: false,
            is_trial_expired: None,
            usage_hours: None,
            session_count: None,
        }
    }

    /// Whole days since install, floored.
    pub fn days_since_install(&self, now: DateTime<Utc>) -> i64 {
        (now - self.install_date).num_days()
    }
}

/// Whether to block the product, and which rule decided it.
///
/// Rules are tried in a fixed order; the first that fires wins.
pub fn evaluate_block(
    policy: &PolicyDocument,
    state: &UserGateState,
    now: DateTime<Utc>,
) -> (bool, GateRule) {
    if state.is_premium {
        return (false, GateRule::Premium);
    }

    let Some(strategy) = &policy.strategy else {
        return (false, GateRule::NoStrategy);
    };

    if strategy.mode == Some(StrategyMode::HardHard) {
        return (true, GateRule::HardHard);
    }

    let trial = &policy.trial;

    if strategy.mode.is_some_and(|m| m.blocks_after_trial()) {
        if state.is_trial_expired == Some(true) {
            return (true, GateRule::TrialExpiredFlag);
        }
        if trial.trial_type == TrialType::TimeBased {
            if let Some(end) = state.trial_end_date {
                if now > end {
                    return (true, GateRule::TrialEndDatePassed);
                }
            }
        }
    }

    if trial.trial_type == TrialType::UsageBased {
        // A zero cap counts as unset
        if let (Some(cap), Some(used)) = (trial.usage_cap_hours, state.usage_hours) {
            if cap > 0.0 && used >= cap {
                return (true, GateRule::UsageHoursExceeded);
            }
        }
        if let (Some(cap), Some(sessions)) = (trial.usage_cap_sessions, state.session_count) {
            if cap > 0 && sessions >= cap {
                return (true, GateRule::SessionCapExceeded);
            }
        }
    }

    if let Some(threshold) = strategy
        .display_timing
        .as_ref()
        .and_then(|t| t.days_since_install_threshold())
    {
        if state.days_since_install(now) as f64 >= threshold {
            return (true, GateRule::DaysSinceInstall);
        }
    }

    (false, GateRule::NoTrigger)
}

/// Whether to block the product for this user at `now`.
pub fn should_block(policy: &PolicyDocument, state: &UserGateState, now: DateTime<Utc>) -> bool {
    evaluate_block(policy, state, now).0
}

/// Whether a feature area is accessible, and which rule decided it.
pub fn evaluate_feature(policy: &PolicyDocument, feature_area: &str, is_premium: bool) -> (bool, GateRule) {
    if is_premium {
        return (true, GateRule::Premium);
    }

    if let Some(permission) = policy.permission(feature_area) {
        return (permission.can_access, GateRule::ExplicitPermission);
    }

    if policy.mode() == Some(StrategyMode::Soft) {
        (true, GateRule::SoftDefault)
    } else {
        (false, GateRule::EnforcedDefault)
    }
}

/// Whether a feature area is accessible.
pub fn can_access_feature(policy: &PolicyDocument, feature_area: &str, is_premium: bool) -> bool {
    evaluate_feature(policy, feature_area, is_premium).0
}

/// Gate decisions on the current time, reported to an observer.
pub struct EntitlementGate {
    clock: Arc<dyn Clock>,
    observer: Arc<dyn DecisionObserver>,
}

impl EntitlementGate {
    /// A gate on the system clock reporting through `tracing`.
    pub fn new() -> Self {
        Self {
            clock: clock::system(),
            observer: Arc::new(TracingObserver),
        }
    }

    /// Use the given clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report decisions to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn DecisionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Whether to block the product for this user now, and which rule decided it.
    pub fn decide_block(&self, policy: &PolicyDocument, state: &UserGateState) -> (bool, GateRule) {
        let (blocked, rule) = evaluate_block(policy, state, self.clock.now());

        self.observer.record(&DecisionTrace {
            kind: DecisionKind::Paywall,
            is_premium: state.is_premium,
            mode: policy.mode(),
            trial_type: policy.trial.trial_type,
            rule,
            outcome: blocked,
        });

        (blocked, rule)
    }

    /// Whether to block the product for this user now.
    pub fn should_block(&self, policy: &PolicyDocument, state: &UserGateState) -> bool {
        self.decide_block(policy, state).0
    }

    /// Whether a feature area is accessible, and which rule decided it.
    pub fn decide_feature(&self, policy: &PolicyDocument, feature_area: &str, is_premium: bool) -> (bool, GateRule) {
        let (accessible, rule) = evaluate_feature(policy, feature_area, is_premium);

        self.observer.record(&DecisionTrace {
            kind: DecisionKind::Feature(feature_area.to_string()),
            is_premium,
            mode: policy.mode(),
            trial_type: policy.trial.trial_type,
            rule,
            outcome: accessible,
        });

        (accessible, rule)
    }

    /// Whether a feature area is accessible.
    pub fn can_access_feature(&self, policy: &PolicyDocument, feature_area: &str, is_premium: bool) -> bool {
        self.decide_feature(policy, feature_area, is_premium).0
    }
}

impl Default for EntitlementGate {
    fn default() -> Self {
        Self::new()
    }
}
