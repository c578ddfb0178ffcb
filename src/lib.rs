//! Storegate - store-backed admission control and optimistic counters
//!
//! This crate coordinates concurrent request handlers through a single shared
//! key-value store. The admission gate enforces fixed-window quotas along
//! several dimensions (caller, group, tenant); the optimistic counter performs
//! watch-and-commit increments with a bounded retry budget. Both take an
//! explicitly constructed store handle, so tests can swap in [`store::MemoryStore`]
//! for [`store::RedisStore`].

pub mod config;
pub mod counter;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use counter::{CounterKey, OptimisticCounter, RetryPolicy};
pub use error::{Result, StoregateError};
pub use ratelimit::{AdmissionGate, QuotaDecision, RateLimiter, UnitOfWork};
pub use store::SharedStore;
