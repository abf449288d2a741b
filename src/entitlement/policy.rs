//! Entitlement policy documents.
//!
//! The policy service speaks a loosely typed JSON format. It is parsed once,
//! at the boundary, into [`PolicyDocument`]; everything downstream works on
//! the validated types only.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::error::{GatekeeperError, Result};

/// Version of the policy schema the fail-safe document is written against.
/// Bump together with any change to the wire format below.
pub const POLICY_SCHEMA_VERSION: u32 = 1;

/// Threshold used when a `days_since_install` trigger carries no value.
pub const DEFAULT_TRIGGER_DAYS: u32 = 7;

/// Trigger type that gates on days since install.
pub const DAYS_SINCE_INSTALL: &str = "days_since_install";

/// Well-known feature areas.
pub mod feature {
    pub const ONBOARDING: &str = "onboarding";
    pub const SETTINGS: &str = "settings";
    pub const CONTACTS_LIST: &str = "contacts_list";
    pub const CONTACT_DETAILS: &str = "contact_details";
    pub const VOICE_NOTES: &str = "voice_notes";
    pub const AI_MESSAGES: &str = "ai_messages";
    pub const SCREENSHOTS: &str = "screenshots";
    pub const ADVANCED_ANALYTICS: &str = "advanced_analytics";
}

/// A policy document that failed validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PolicyValidationError(String);

/// How strictly the paywall is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyMode {
    /// Always blocked unless premium
    HardHard,
    /// Blocked once the trial ends
    Hard,
    /// Blocked once the trial ends, softer presentation
    HardSoft,
    /// Never blocked outright; unlisted features stay open
    Soft,
}

impl StrategyMode {
    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyMode::HardHard => "hard-hard",
            StrategyMode::Hard => "hard",
            StrategyMode::HardSoft => "hard-soft",
            StrategyMode::Soft => "soft",
        }
    }

    fn parse(s: &str) -> std::result::Result<Self, PolicyValidationError> {
        match s {
            "hard-hard" => Ok(StrategyMode::HardHard),
            "hard" => Ok(StrategyMode::Hard),
            "hard-soft" => Ok(StrategyMode::HardSoft),
            "soft" => Ok(StrategyMode::Soft),
            other => Err(PolicyValidationError(format!("unknown strategy mode '{}'", other))),
        }
    }

    /// Whether an expired trial blocks access under this mode.
    pub fn blocks_after_trial(&self) -> bool {
        matches!(self, StrategyMode::Hard | StrategyMode::HardSoft)
    }
}

impl std::fmt::Display for StrategyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the paywall is presented.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayTiming {
    pub trigger_type: String,
    pub trigger_value: Option<f64>,
}

impl DisplayTiming {
    /// The install-age threshold in days, if this is a `days_since_install` trigger.
    pub fn days_since_install_threshold(&self) -> Option<f64> {
        (self.trigger_type == DAYS_SINCE_INSTALL)
            .then(|| self.trigger_value.unwrap_or(f64::from(DEFAULT_TRIGGER_DAYS)))
    }
}

/// Enforcement strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Strategy {
    pub id: Option<String>,
    pub name: Option<String>,
    /// `None` when the service sent a strategy without a mode; no enforcing
    /// rule applies, but usage caps and display timing still do
    pub mode: Option<StrategyMode>,
    pub can_skip: bool,
    pub show_at: Option<String>,
    pub display_timing: Option<DisplayTiming>,
}

/// Kind of trial offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrialType {
    TimeBased,
    UsageBased,
    None,
}

impl TrialType {
    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialType::TimeBased => "time_based",
            TrialType::UsageBased => "usage_based",
            TrialType::None => "none",
        }
    }

    fn parse(s: &str) -> std::result::Result<Self, PolicyValidationError> {
        match s {
            "time_based" => Ok(TrialType::TimeBased),
            "usage_based" => Ok(TrialType::UsageBased),
            "none" => Ok(TrialType::None),
            other => Err(PolicyValidationError(format!("unknown trial type '{}'", other))),
        }
    }
}

/// Trial terms.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub id: Option<String>,
    pub name: Option<String>,
    pub trial_type: TrialType,
    pub duration_days: Option<u32>,
    pub usage_cap_hours: Option<f64>,
    pub usage_cap_sessions: Option<u64>,
}

impl Trial {
    /// No trial at all.
    pub fn none() -> Self {
        Self {
            id: None,
            name: None,
            trial_type: TrialType::None,
            duration_days: None,
            usage_cap_hours: None,
            usage_cap_sessions: None,
        }
    }
}

/// Access granted to one feature area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub feature_area: String,
    pub can_access: bool,
    pub access_level: String,
}

impl Permission {
    fn new(feature_area: &str, can_access: bool, access_level: &str) -> Self {
        Self {
            feature_area: feature_area.to_string(),
            can_access,
            access_level: access_level.to_string(),
        }
    }
}

/// A validated entitlement policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPolicyDocument", into = "RawPolicyDocument")]
pub struct PolicyDocument {
    /// Absent strategy means no enforcement
    pub strategy: Option<Strategy>,
    pub trial: Trial,
    pub permissions: Vec<Permission>,
    pub trial_ended: Option<bool>,
    pub can_show_review_prompt: Option<bool>,
}

impl PolicyDocument {
    /// Parse and validate a JSON policy document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GatekeeperError::PolicyInvalid(e.to_string()))
    }

    /// Parse and validate an already decoded JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| GatekeeperError::PolicyInvalid(e.to_string()))
    }

    /// The strategy mode, if any strategy is defined.
    pub fn mode(&self) -> Option<StrategyMode> {
        self.strategy.as_ref().and_then(|s| s.mode)
    }

    /// The permission entry for a feature area.
    pub fn permission(&self, feature_area: &str) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.feature_area == feature_area)
    }

    /// The conservative policy served when no policy can be fetched or read
    /// from cache: a hard paywall after a 7-day trial, with only navigation
    /// and the contact list left open.
    ///
    /// Written against [`POLICY_SCHEMA_VERSION`].
    pub fn fail_safe() -> Self {
        Self {
            strategy: Some(Strategy {
                id: Some("HARD_AFTER_7D".to_string()),
                name: Some("Hard: 7-Day Trial".to_string()),
                mode: Some(StrategyMode::Hard),
                can_skip: false,
                show_at: Some("after_trial".to_string()),
                display_timing: Some(DisplayTiming {
                    trigger_type: DAYS_SINCE_INSTALL.to_string(),
                    trigger_value: Some(f64::from(DEFAULT_TRIGGER_DAYS)),
                }),
            }),
            trial: Trial {
                id: Some("TRIAL_7_DAYS".to_string()),
                name: Some("7 Day Trial".to_string()),
                trial_type: TrialType::TimeBased,
                duration_days: Some(7),
                usage_cap_hours: None,
                usage_cap_sessions: None,
            },
            permissions: vec![
                Permission::new(feature::ONBOARDING, true, "full"),
                Permission::new(feature::SETTINGS, true, "full"),
                Permission::new(feature::CONTACTS_LIST, true, "view"),
                Permission::new(feature::CONTACT_DETAILS, false, "none"),
                Permission::new(feature::VOICE_NOTES, false, "none"),
                Permission::new(feature::AI_MESSAGES, false, "none"),
                Permission::new(feature::SCREENSHOTS, false, "none"),
                Permission::new(feature::ADVANCED_ANALYTICS, false, "none"),
            ],
            trial_ended: Some(false),
            can_show_review_prompt: Some(false),
        }
    }
}

// Wire format

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPolicyDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    strategy: Option<RawStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trial: Option<RawTrial>,
    #[serde(default, deserialize_with = "lenient_permissions")]
    permissions: Vec<RawPermission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    trial_ended: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    can_show_review_prompt: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStrategy {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    mode: Option<String>,
    #[serde(default)]
    can_skip: Option<bool>,
    #[serde(default)]
    show_at: Option<String>,
    #[serde(default)]
    display_timing: Option<RawDisplayTiming>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawDisplayTiming {
    trigger_type: String,
    #[serde(default)]
    trigger_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTrial {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    trial_type: Option<String>,
    #[serde(default)]
    duration_days: Option<u32>,
    #[serde(default)]
    usage_cap_hours: Option<f64>,
    #[serde(default)]
    usage_cap_sessions: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPermission {
    feature_area: String,
    can_access: bool,
    #[serde(default)]
    access_level: Option<String>,
}

/// Keep the well-formed permission entries and drop the rest, so one bad
/// entry does not discard the server's whole permission list.
fn lenient_permissions<'de, D>(deserializer: D) -> std::result::Result<Vec<RawPermission>, D::Error>
where
    D: Deserializer<'de>,
{
    let entries: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;

    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<RawPermission>(entry) {
            Ok(permission) => Some(permission),
            Err(e) => {
                warn!(error = %e, "Dropping malformed permission entry");
                None
            }
        })
        .collect())
}

impl TryFrom<RawPolicyDocument> for PolicyDocument {
    type Error = PolicyValidationError;

    fn try_from(raw: RawPolicyDocument) -> std::result::Result<Self, Self::Error> {
        let strategy = raw.strategy.map(Strategy::try_from).transpose()?;
        let trial = match raw.trial {
            Some(trial) => Trial::try_from(trial)?,
            None => Trial::none(),
        };
        let permissions = raw
            .permissions
            .into_iter()
            .map(|p| Permission {
                feature_area: p.feature_area,
                can_access: p.can_access,
                access_level: p
                    .access_level
                    .unwrap_or_else(|| if p.can_access { "full" } else { "none" }.to_string()),
            })
            .collect();

        Ok(Self {
            strategy,
            trial,
            permissions,
            trial_ended: raw.trial_ended,
            can_show_review_prompt: raw.can_show_review_prompt,
        })
    }
}

impl TryFrom<RawStrategy> for Strategy {
    type Error = PolicyValidationError;

    fn try_from(raw: RawStrategy) -> std::result::Result<Self, Self::Error> {
        let mode = raw.mode.as_deref().map(StrategyMode::parse).transpose()?;

        let display_timing = match raw.display_timing {
            Some(timing) => {
                if let Some(value) = timing.trigger_value {
                    if !value.is_finite() || value < 0.0 {
                        return Err(PolicyValidationError(format!(
                            "display_timing.trigger_value must be a non-negative number, got {}",
                            value
                        )));
                    }
                }
                Some(DisplayTiming {
                    trigger_type: timing.trigger_type,
                    trigger_value: timing.trigger_value,
                })
            }
            None => None,
        };

        Ok(Self {
            id: raw.id,
            name: raw.name,
            mode,
            can_skip: raw.can_skip.unwrap_or(false),
            show_at: raw.show_at,
            display_timing,
        })
    }
}

impl TryFrom<RawTrial> for Trial {
    type Error = PolicyValidationError;

    fn try_from(raw: RawTrial) -> std::result::Result<Self, Self::Error> {
        let trial_type = match raw.trial_type.as_deref() {
            Some(t) => TrialType::parse(t)?,
            None => TrialType::None,
        };

        if let Some(hours) = raw.usage_cap_hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(PolicyValidationError(format!(
                    "trial.usage_cap_hours must be a non-negative number, got {}",
                    hours
                )));
            }
        }

        Ok(Self {
            id: raw.id,
            name: raw.name,
            trial_type,
            duration_days: raw.duration_days,
            usage_cap_hours: raw.usage_cap_hours,
            usage_cap_sessions: raw.usage_cap_sessions,
        })
    }
}

impl From<PolicyDocument> for RawPolicyDocument {
    fn from(doc: PolicyDocument) -> Self {
        Self {
            strategy: doc.strategy.map(|s| RawStrategy {
                id: s.id,
                name: s.name,
                mode: s.mode.map(|m| m.as_str().to_string()),
                can_skip: Some(s.can_skip),
                show_at: s.show_at,
                display_timing: s.display_timing.map(|t| RawDisplayTiming {
                    trigger_type: t.trigger_type,
                    trigger_value: t.trigger_value,
                }),
            }),
            trial: Some(RawTrial {
                id: doc.trial.id,
                name: doc.trial.name,
                trial_type: Some(doc.trial.trial_type.as_str().to_string()),
                duration_days: doc.trial.duration_days,
                usage_cap_hours: doc.trial.usage_cap_hours,
                usage_cap_sessions: doc.trial.usage_cap_sessions,
            }),
            permissions: doc
                .permissions
                .into_iter()
                .map(|p| RawPermission {
                    feature_area: p.feature_area,
                    can_access: p.can_access,
                    access_level: Some(p.access_level),
                })
                .collect(),
            trial_ended: doc.trial_ended,
            can_show_review_prompt: doc.can_show_review_prompt,
        }
    }
}
