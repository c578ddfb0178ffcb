//! Optimistic resource counters.

mod backoff;
mod optimistic;
mod sleeper;

pub use backoff::{Backoff, Jitter, RetryPolicy, DEFAULT_BACKOFF, DEFAULT_MAX_ATTEMPTS};
pub use optimistic::{CounterKey, OptimisticCounter, DEFAULT_COUNTER_NAME, DEFAULT_NAMESPACE};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
