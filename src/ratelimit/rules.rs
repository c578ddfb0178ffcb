//! Admission rule configuration.
//!
//! Rules are evaluated in the order they are declared. Each one names the
//! quota dimension, where its identifier comes from on the unit of work, and
//! the fixed-window limit to apply.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::gate::UnitOfWork;
use super::quota::QuotaRule;
use crate::error::{Result, StoregateError};

/// Which attribute of a unit of work identifies it for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierSource {
    /// Caller identity, e.g. the source address
    Caller,
    /// Group or region
    Group,
    /// Tenant or customer
    Tenant,
}

/// One entry of the admission gate's ordered rule list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRule {
    /// The quota to enforce
    #[serde(flatten)]
    pub quota: QuotaRule,
    /// Where the identifier comes from
    pub source: IdentifierSource,
    /// Identifier to use when the unit of work does not carry one.
    /// Without a default the rule is skipped for such units.
    #[serde(default)]
    pub default_identifier: Option<String>,
}

impl AdmissionRule {
    /// Create a rule without a default identifier.
    pub fn new(
        dimension: &str,
        source: IdentifierSource,
        limit: u64,
        window_secs: u64,
    ) -> Result<Self> {
        Ok(Self {
            quota: QuotaRule::new(dimension, limit, window_secs)?,
            source,
            default_identifier: None,
        })
    }

    /// Use `identifier` when the unit of work carries none.
    pub fn with_default(mut self, identifier: impl Into<String>) -> Self {
        self.default_identifier = Some(identifier.into());
        self
    }

    /// Pick the identifier this rule counts `unit` under.
    pub fn identifier<'a>(&'a self, unit: &'a UnitOfWork) -> Option<&'a str> {
        let extracted = match self.source {
            IdentifierSource::Caller => Some(unit.caller.as_str()),
            IdentifierSource::Group => unit.group.as_deref(),
            IdentifierSource::Tenant => unit.tenant.as_deref(),
        };

        extracted
            .filter(|id| !id.is_empty())
            .or(self.default_identifier.as_deref())
    }
}

/// An ordered set of admission rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRules {
    /// Rules in evaluation order
    #[serde(default)]
    pub rules: Vec<AdmissionRule>,
}

impl Default for AdmissionRules {
    /// Per-address, then per-region, then per-customer.
    fn default() -> Self {
        Self {
            rules: vec![
                AdmissionRule {
                    quota: QuotaRule {
                        dimension: "ip".to_string(),
                        limit: 100,
                        window_secs: 60,
                    },
                    source: IdentifierSource::Caller,
                    default_identifier: None,
                },
                AdmissionRule {
                    quota: QuotaRule {
                        dimension: "region".to_string(),
                        limit: 1000,
                        window_secs: 3600,
                    },
                    source: IdentifierSource::Group,
                    default_identifier: Some("default".to_string()),
                },
                AdmissionRule {
                    quota: QuotaRule {
                        dimension: "customer".to_string(),
                        limit: 500,
                        window_secs: 3600,
                    },
                    source: IdentifierSource::Tenant,
                    default_identifier: None,
                },
            ],
        }
    }
}

impl AdmissionRules {
    /// Create a rule set from an ordered list.
    pub fn new(rules: Vec<AdmissionRule>) -> Result<Self> {
        let rules = Self { rules };
        rules.validate()?;
        Ok(rules)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a mapping with a `rules` key or a bare sequence.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules = match serde_yaml::from_str::<Vec<AdmissionRule>>(yaml) {
            Ok(rules) => Self { rules },
            Err(_) => serde_yaml::from_str::<AdmissionRules>(yaml).map_err(|e| {
                StoregateError::Config(format!("Failed to parse admission rules: {}", e))
            })?,
        };
        rules.validate()?;
        Ok(rules)
    }

    /// Check every rule and reject duplicate dimensions.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.quota.validate()?;
            if !seen.insert(rule.quota.dimension.as_str()) {
                return Err(StoregateError::Config(format!(
                    "duplicate admission rule for dimension '{}'",
                    rule.quota.dimension
                )));
            }
        }
        Ok(())
    }

    /// Number of configured rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Iterate over the rules in evaluation order.
    pub fn iter(&self) -> std::slice::Iter<'_, AdmissionRule> {
        self.rules.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = AdmissionRules::default();
        assert!(rules.validate().is_ok());

        let dims: Vec<_> = rules.iter().map(|r| r.quota.dimension.as_str()).collect();
        assert_eq!(dims, vec!["ip", "region", "customer"]);
        assert_eq!(rules.rules[0].quota.limit, 100);
        assert_eq!(rules.rules[0].quota.window_secs, 60);
        assert_eq!(rules.rules[1].default_identifier.as_deref(), Some("default"));
    }

    #[test]
    fn test_parse_rules_mapping() {
        let yaml = r#"
rules:
  - dimension: ip
    source: caller
    limit: 3
    window_secs: 60
  - dimension: region
    source: group
    default_identifier: default
    limit: 10
    window_secs: 3600
"#;
        let rules = AdmissionRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules[0].quota.limit, 3);
        assert_eq!(rules.rules[1].source, IdentifierSource::Group);
        assert_eq!(rules.rules[1].default_identifier.as_deref(), Some("default"));
    }

    #[test]
    fn test_parse_rules_sequence() {
        let yaml = r#"
- dimension: customer
  source: tenant
  limit: 500
  window_secs: 3600
"#;
        let rules = AdmissionRules::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules.rules[0].source, IdentifierSource::Tenant);
        assert!(rules.rules[0].default_identifier.is_none());
    }

    #[test]
    fn test_parse_rejects_zero_limit() {
        let yaml = r#"
rules:
  - dimension: ip
    source: caller
    limit: 0
    window_secs: 60
"#;
        assert!(matches!(
            AdmissionRules::from_yaml(yaml),
            Err(StoregateError::Config(_))
        ));
    }

    #[test]
    fn test_parse_rejects_unknown_source() {
        let yaml = r#"
rules:
  - dimension: ip
    source: planet
    limit: 1
    window_secs: 60
"#;
        assert!(AdmissionRules::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_duplicate_dimension_rejected() {
        let rule = AdmissionRule::new("ip", IdentifierSource::Caller, 1, 1).unwrap();
        let result = AdmissionRules::new(vec![rule.clone(), rule]);
        assert!(result.is_err());
    }

    #[test]
    fn test_identifier_extraction() {
        let unit = UnitOfWork::new("10.0.0.1").with_group("eu-west");

        let caller = AdmissionRule::new("ip", IdentifierSource::Caller, 1, 1).unwrap();
        let group = AdmissionRule::new("region", IdentifierSource::Group, 1, 1).unwrap();
        let tenant = AdmissionRule::new("customer", IdentifierSource::Tenant, 1, 1).unwrap();

        assert_eq!(caller.identifier(&unit), Some("10.0.0.1"));
        assert_eq!(group.identifier(&unit), Some("eu-west"));
        assert_eq!(tenant.identifier(&unit), None);
    }

    #[test]
    fn test_identifier_default_fallback() {
        let unit = UnitOfWork::new("10.0.0.1").with_group("");
        let group = AdmissionRule::new("region", IdentifierSource::Group, 1, 1)
            .unwrap()
            .with_default("default");

        assert_eq!(group.identifier(&unit), Some("default"));
    }
}
