//! Entitlement policies.
//!
//! Policies are fetched from a remote service, cached in memory and in a
//! persisted store, and evaluated by the gate to decide whether a user
//! should see the paywall or may use a feature.

mod cache;
mod gate;
mod persist;
mod policy;
mod source;
mod trace;

pub use cache::{
    CacheOptions, CachedPolicy, PolicyCache, PolicyOrigin, ResolvedPolicy, CACHE_KEY,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_RETRY_BACKOFF, DEFAULT_TTL,
};
pub use gate::{
    can_access_feature, evaluate_block, evaluate_feature, should_block, EntitlementGate,
    UserGateState,
};
pub use persist::{FilePolicyStore, MemoryPolicyStore, PersistenceBackend, PolicyStore};
pub use policy::{
    feature, DisplayTiming, Permission, PolicyDocument, PolicyValidationError, RawPolicyDocument,
    Strategy, StrategyMode, Trial, TrialType, DAYS_SINCE_INSTALL, DEFAULT_TRIGGER_DAYS,
    POLICY_SCHEMA_VERSION,
};
pub use source::{FetchError, HttpPolicySource, Platform, PolicySource};
pub use trace::{
    DecisionKind, DecisionObserver, DecisionTrace, GateRule, NoopObserver, TracingObserver,
};
