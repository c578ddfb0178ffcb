//! Admission gate: evaluates every applicable rule for a unit of work.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::limiter::RateLimiter;
use super::quota::QuotaDecision;
use super::rules::AdmissionRules;
use crate::error::Result;
use crate::store::SharedStore;

/// What the transport layer knows about an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Caller identity, typically the source address
    pub caller: String,
    /// Group or region, if supplied
    pub group: Option<String>,
    /// Tenant or customer, if supplied
    pub tenant: Option<String>,
    /// Target resource for counter operations
    pub resource: Option<String>,
}

impl UnitOfWork {
    /// Describe a request from `caller`.
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            ..Self::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }
}

/// Combines per-dimension quota checks into one decision.
///
/// Rules run in order and the first denial wins: later rules are not
/// evaluated, so their counters are left untouched for that unit of work.
#[derive(Debug)]
pub struct AdmissionGate<S> {
    limiter: RateLimiter<S>,
    rules: RwLock<Arc<AdmissionRules>>,
}

impl<S: SharedStore> AdmissionGate<S> {
    /// Create a gate over `limiter` with the given rules.
    pub fn new(limiter: RateLimiter<S>, rules: AdmissionRules) -> Self {
        Self {
            limiter,
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Replace the rule set.
    pub fn set_rules(&self, rules: AdmissionRules) {
        info!(rules = rules.len(), "Replacing admission rules");
        *self.rules.write() = Arc::new(rules);
    }

    /// The current rule set.
    pub fn rules(&self) -> Arc<AdmissionRules> {
        Arc::clone(&self.rules.read())
    }

    /// The limiter used for each rule.
    pub fn limiter(&self) -> &RateLimiter<S> {
        &self.limiter
    }

    /// Decide whether `unit` may proceed.
    #[instrument(
        skip(self, unit),
        fields(
            caller = %unit.caller,
            group = ?unit.group,
            tenant = ?unit.tenant
        )
    )]
    pub async fn admit(&self, unit: &UnitOfWork) -> Result<QuotaDecision> {
        // Snapshot so a concurrent reload cannot change rules mid-evaluation.
        let rules = self.rules();

        for rule in rules.iter() {
            let Some(identifier) = rule.identifier(unit) else {
                debug!(
                    dimension = %rule.quota.dimension,
                    "No identifier for rule, skipping"
                );
                continue;
            };

            let key = rule.quota.key_for(identifier);
            let decision = self.limiter.evaluate(&key, &rule.quota).await?;

            if !decision.is_allowed() {
                info!(
                    key = %key,
                    retry_after_secs = ?decision.retry_after_secs(),
                    "Unit of work rejected"
                );
                return Ok(decision);
            }
        }

        Ok(QuotaDecision::Allowed)
    }

    /// Like [`admit`](Self::admit), but a denial becomes
    /// [`StoregateError::QuotaExceeded`](crate::error::StoregateError::QuotaExceeded).
    pub async fn check(&self, unit: &UnitOfWork) -> Result<()> {
        self.admit(unit).await?.into_result()
    }
}
