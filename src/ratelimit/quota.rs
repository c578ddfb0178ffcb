//! Quota rules, keys and decisions.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoregateError};

/// A fixed-window limit on one dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRule {
    /// Dimension name, used as the first segment of the quota key
    pub dimension: String,
    /// Maximum occurrences allowed within one window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl QuotaRule {
    /// Create a rule, rejecting zero limits and windows.
    pub fn new(dimension: impl Into<String>, limit: u64, window_secs: u64) -> Result<Self> {
        let rule = Self {
            dimension: dimension.into(),
            limit,
            window_secs,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Check the rule's invariants.
    pub fn validate(&self) -> Result<()> {
        if self.dimension.is_empty() {
            return Err(StoregateError::Config(
                "quota rule dimension must not be empty".to_string(),
            ));
        }
        if self.limit == 0 {
            return Err(StoregateError::Config(format!(
                "quota rule '{}' must have a limit greater than zero",
                self.dimension
            )));
        }
        if self.window_secs == 0 {
            return Err(StoregateError::Config(format!(
                "quota rule '{}' must have a window greater than zero",
                self.dimension
            )));
        }
        Ok(())
    }

    /// Build the key this rule counts under for `identifier`.
    pub fn key_for(&self, identifier: &str) -> QuotaKey {
        QuotaKey::new(&self.dimension, identifier)
    }
}

/// Identifies one fixed-window counter: `dimension:identifier`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct QuotaKey {
    /// The dimension this key belongs to
    pub dimension: String,
    /// The caller, group or tenant being counted
    pub identifier: String,
}

impl QuotaKey {
    /// Create a new quota key.
    pub fn new(dimension: &str, identifier: &str) -> Self {
        Self {
            dimension: dimension.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// The key as stored in the backend, under `prefix`.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self)
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dimension, self.identifier)
    }
}

/// Outcome of evaluating one or more quota rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum QuotaDecision {
    /// Within quota
    Allowed,
    /// Over quota on `key`
    Denied {
        key: QuotaKey,
        /// Seconds until the window resets. Zero means unknown: retry
        /// immediately rather than assume no limit.
        retry_after_secs: u64,
    },
}

impl QuotaDecision {
    /// Whether the unit of work may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }

    /// Seconds to wait before retrying, if denied.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            QuotaDecision::Allowed => None,
            QuotaDecision::Denied {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
        }
    }

    /// Turn a denial into [`StoregateError::QuotaExceeded`].
    pub fn into_result(self) -> Result<()> {
        match self {
            QuotaDecision::Allowed => Ok(()),
            QuotaDecision::Denied {
                key,
                retry_after_secs,
            } => Err(StoregateError::QuotaExceeded {
                key: key.to_string(),
                retry_after_secs,
            }),
        }
    }
}
