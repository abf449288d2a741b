//! Fixed window rate limiting.

mod counter;
mod key;
mod limiter;
mod rules;
mod store;

pub use counter::{CounterRecord, TimeWindow};
pub(crate) use counter::to_chrono;
pub use key::{client_ip, user_id, AuthenticatedUser, KeyGenerator, DEFAULT_KEY};
pub use limiter::{FailureMode, RateLimitDecision, RateLimitPolicy, RateLimiter, MIN_WINDOW};
pub use rules::{KeySource, LimitRule, LimitTable};
pub use store::{spawn_cleanup, Acquisition, CounterStore, MemoryCounterStore, StoreBackend, StoreError};
