//! Decision traces.
//!
//! Gate evaluation is pure; what it decided, and why, is handed to an
//! injected [`DecisionObserver`] as one [`DecisionTrace`] per decision.

use std::fmt;
use tracing::debug;

use super::policy::{StrategyMode, TrialType};

/// The rule that settled a gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateRule {
    /// Paying users are never blocked
    Premium,
    /// The policy defines no strategy, so nothing is enforced
    NoStrategy,
    /// `hard-hard` blocks every non-premium user
    HardHard,
    /// The caller reported the trial as expired
    TrialExpiredFlag,
    /// A time-based trial's end date has passed
    TrialEndDatePassed,
    /// Usage hours reached the trial cap
    UsageHoursExceeded,
    /// Session count reached the trial cap
    SessionCapExceeded,
    /// Install age reached the display threshold
    DaysSinceInstall,
    /// No trigger fired
    NoTrigger,
    /// An explicit permission entry decided feature access
    ExplicitPermission,
    /// Unlisted feature under a `soft` strategy
    SoftDefault,
    /// Unlisted feature under an enforcing or missing strategy
    EnforcedDefault,
}

impl GateRule {
    /// Short stable name, suitable for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            GateRule::Premium => "premium",
            GateRule::NoStrategy => "no_strategy",
            GateRule::HardHard => "hard_hard",
            GateRule::TrialExpiredFlag => "trial_expired_flag",
            GateRule::TrialEndDatePassed => "trial_end_date_passed",
            GateRule::UsageHoursExceeded => "usage_hours_exceeded",
            GateRule::SessionCapExceeded => "session_cap_exceeded",
            GateRule::DaysSinceInstall => "days_since_install",
            GateRule::NoTrigger => "no_trigger",
            GateRule::ExplicitPermission => "explicit_permission",
            GateRule::SoftDefault => "soft_default",
            GateRule::EnforcedDefault => "enforced_default",
        }
    }
}

impl fmt::Display for GateRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was asked of the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionKind {
    /// Whether to block the product as a whole
    Paywall,
    /// Whether one feature area is accessible
    Feature(String),
}

/// One gate decision with its inputs and the rule that settled it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTrace {
    pub kind: DecisionKind,
    pub is_premium: bool,
    pub mode: Option<StrategyMode>,
    pub trial_type: TrialType,
    pub rule: GateRule,
    /// `true` means blocked for paywall decisions and accessible for feature decisions
    pub outcome: bool,
}

/// Receives gate decisions.
pub trait DecisionObserver: Send + Sync {
    fn record(&self, trace: &DecisionTrace);
}

/// Emits each decision as a `debug` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl DecisionObserver for TracingObserver {
    fn record(&self, trace: &DecisionTrace) {
        match &trace.kind {
            DecisionKind::Paywall => debug!(
                rule = %trace.rule,
                blocked = trace.outcome,
                premium = trace.is_premium,
                mode = ?trace.mode,
                trial_type = ?trace.trial_type,
                "Paywall decision"
            ),
            DecisionKind::Feature(area) => debug!(
                feature_area = %area,
                rule = %trace.rule,
                accessible = trace.outcome,
                premium = trace.is_premium,
                mode = ?trace.mode,
                "Feature access decision"
            ),
        }
    }
}

/// Discards every decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl DecisionObserver for NoopObserver {
    fn record(&self, _trace: &DecisionTrace) {}
}
