//! Named rate limit rules.
//!
//! A limit table maps a name (a preset such as `auth`, or a route such as
//! `POST:/v1/contacts`) to a quota and a way of keying requests. Tables load
//! from YAML and layer over the built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::counter::TimeWindow;
use super::key::KeyGenerator;
use super::limiter::RateLimitPolicy;
use crate::error::{GatekeeperError, Result};

/// How a rule derives the counter key from a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Client address from forwarding headers
    ClientIp,
    /// Authenticated user id
    #[default]
    UserId,
    /// One shared key for every request
    Constant,
}

/// A quota and its keying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeWindow,
    /// Units per window, e.g. 15 minutes
    #[serde(default = "default_units")]
    pub units: u32,
    /// How requests are keyed
    #[serde(default)]
    pub key: KeySource,
    /// Key prefix; defaults to the rule's name in the table
    #[serde(default)]
    pub prefix: Option<String>,
}

fn default_units() -> u32 {
    1
}

impl LimitRule {
    fn new(requests_per_unit: u64, unit: TimeWindow, units: u32, key: KeySource) -> Self {
        Self {
            requests_per_unit,
            unit,
            units,
            key,
            prefix: None,
        }
    }

    /// Build the policy for this rule, prefixing keys with `name` unless the
    /// rule names its own prefix.
    pub fn to_policy(&self, name: &str) -> RateLimitPolicy {
        let prefix = self.prefix.clone().unwrap_or_else(|| name.to_string());
        let key_generator = match self.key {
            KeySource::ClientIp => KeyGenerator::client_ip(prefix),
            KeySource::UserId => KeyGenerator::user_id(prefix),
            KeySource::Constant => KeyGenerator::constant(prefix),
        };

        RateLimitPolicy::new(self.unit.times(self.units), self.requests_per_unit)
            .keyed_by(key_generator)
    }
}

/// A table of named limit rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitTable {
    /// Rules by name
    #[serde(default)]
    pub limits: BTreeMap<String, LimitRule>,
}

impl LimitTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in presets and per-route quotas.
    pub fn builtin() -> Self {
        use KeySource::{ClientIp, UserId};
        use TimeWindow::{Hour, Minute, Second};

        let entries = [
            // Presets
            ("auth", LimitRule::new(5, Minute, 15, ClientIp)),
            ("api", LimitRule::new(100, Minute, 1, UserId)),
            ("public", LimitRule::new(20, Minute, 1, ClientIp)),
            // Caller-level quotas
            ("api_key", LimitRule::new(100, Minute, 1, UserId)),
            ("ip", LimitRule::new(10, Minute, 1, ClientIp)),
            ("org", LimitRule::new(3000, Hour, 1, UserId)),
            // Expensive compute
            ("POST:/v1/messages/generate", LimitRule::new(30, Hour, 1, UserId)),
            ("POST:/v1/warmth/recompute", LimitRule::new(20, Hour, 1, UserId)),
            ("GET:/v1/contacts/:id/context-bundle", LimitRule::new(60, Hour, 1, UserId)),
            ("POST:/v1/outbox", LimitRule::new(50, Hour, 1, UserId)),
            // Writes
            ("POST:/v1/contacts", LimitRule::new(50, Minute, 1, UserId)),
            ("PATCH:/v1/contacts/:id", LimitRule::new(50, Minute, 1, UserId)),
            ("DELETE:/v1/contacts/:id", LimitRule::new(20, Minute, 1, UserId)),
            ("POST:/v1/contacts/:id/channels", LimitRule::new(30, Minute, 1, UserId)),
            ("PATCH:/v1/contacts/:id/channels/:channelId", LimitRule::new(50, Minute, 1, UserId)),
            ("DELETE:/v1/contacts/:id/channels/:channelId", LimitRule::new(20, Minute, 1, UserId)),
            ("PATCH:/v1/contacts/:id/preferences", LimitRule::new(50, Minute, 1, UserId)),
            ("POST:/v1/interactions", LimitRule::new(100, Minute, 1, UserId)),
            ("PATCH:/v1/interactions/:id", LimitRule::new(50, Minute, 1, UserId)),
            ("DELETE:/v1/interactions/:id", LimitRule::new(20, Minute, 1, UserId)),
            ("POST:/v1/policies/autopilot", LimitRule::new(10, Hour, 1, UserId)),
            // Reads
            ("GET:/v1/contacts", LimitRule::new(200, Hour, 1, UserId)),
            ("GET:/v1/contacts/:id", LimitRule::new(300, Hour, 1, UserId)),
            ("GET:/v1/contacts/:id/preferences", LimitRule::new(100, Hour, 1, UserId)),
            ("GET:/v1/contacts/:id/channels", LimitRule::new(100, Hour, 1, UserId)),
            ("GET:/v1/contacts/:id/effective-channel", LimitRule::new(150, Hour, 1, UserId)),
            ("GET:/v1/interactions", LimitRule::new(200, Hour, 1, UserId)),
            ("GET:/v1/policies/autopilot", LimitRule::new(100, Hour, 1, UserId)),
            // Burst protection
            ("bulk_writes", LimitRule::new(5, Second, 10, UserId)),
            ("search", LimitRule::new(20, Second, 30, UserId)),
        ];

        Self {
            limits: entries
                .into_iter()
                .map(|(name, rule)| (name.to_string(), rule))
                .collect(),
        }
    }

    /// Load a table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a table from YAML, rejecting rules that admit nothing.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: LimitTable = serde_yaml::from_str(yaml)?;

        if let Some((name, _)) = table.limits.iter().find(|(_, rule)| rule.requests_per_unit == 0) {
            return Err(GatekeeperError::Config(format!(
                "rate limit rule '{}' must allow at least one request",
                name
            )));
        }

        Ok(table)
    }

    /// Layer `overrides` on top of this table. Rules with the same name are replaced.
    pub fn merged(mut self, overrides: LimitTable) -> Self {
        self.limits.extend(overrides.limits);
        self
    }

    /// Find a rule by name.
    pub fn find(&self, name: &str) -> Option<&LimitRule> {
        self.limits.get(name)
    }

    /// Build the policy for a named rule.
    pub fn policy(&self, name: &str) -> Option<RateLimitPolicy> {
        self.find(name).map(|rule| rule.to_policy(name))
    }
}
