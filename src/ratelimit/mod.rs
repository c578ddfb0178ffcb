//! Fixed-window rate limiting and the admission gate built on it.

mod gate;
mod limiter;
mod quota;
mod rules;

pub use gate::{AdmissionGate, UnitOfWork};
pub use limiter::{RateLimiter, DEFAULT_KEY_PREFIX};
pub use quota::{QuotaDecision, QuotaKey, QuotaRule};
pub use rules::{AdmissionRule, AdmissionRules, IdentifierSource};
