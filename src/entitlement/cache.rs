//! Policy cache.
//!
//! Resolution order for [`PolicyCache::get_config`]:
//!
//! 1. the in-memory copy, while younger than the TTL
//! 2. a fetch already in flight, shared by every concurrent caller
//! 3. the persisted copy, while younger than the TTL
//! 4. a fresh fetch, persisted and held in memory on success
//! 5. the persisted copy regardless of age, if the fetch failed
//! 6. the fail-safe policy, which is never cached
//!
//! After a failed fetch the stale or fail-safe result is served for
//! [`CacheOptions::retry_backoff`] before the network is tried again.
//!
//! The call itself never fails.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::persist::PolicyStore;
use super::policy::PolicyDocument;
use super::source::{FetchError, Platform, PolicySource};
use crate::clock::{self, Clock};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::to_chrono;

/// Key under which the policy is persisted.
pub const CACHE_KEY: &str = "@paywall_config";

/// How long a fetched policy is served without refetching.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Upper bound on a single fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a failed fetch's fallback is served before retrying.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// The persisted form of a fetched policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedPolicy {
    pub document: PolicyDocument,
    pub fetched_at: DateTime<Utc>,
}

impl CachedPolicy {
    /// Whether the entry is still within `ttl` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.fetched_at < to_chrono(ttl)
    }
}

/// Where a resolved policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOrigin {
    Memory,
    Persisted,
    Fetched,
    /// Persisted copy past its TTL, served because the fetch failed
    Stale,
    FailSafe,
}

impl PolicyOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyOrigin::Memory => "memory",
            PolicyOrigin::Persisted => "persisted",
            PolicyOrigin::Fetched => "fetched",
            PolicyOrigin::Stale => "stale",
            PolicyOrigin::FailSafe => "fail_safe",
        }
    }
}

impl fmt::Display for PolicyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy together with where it came from.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub document: Arc<PolicyDocument>,
    pub origin: PolicyOrigin,
    /// `None` for the fail-safe policy
    pub fetched_at: Option<DateTime<Utc>>,
}

/// Tunables for [`PolicyCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub platform: Platform,
    pub ttl: Duration,
    pub fetch_timeout: Duration,
    /// Zero retries on every call
    pub retry_backoff: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            ttl: DEFAULT_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    document: Arc<PolicyDocument>,
    fetched_at: DateTime<Utc>,
}

/// A fallback result and when the network may be tried again.
#[derive(Debug, Clone)]
struct Backoff {
    resolved: ResolvedPolicy,
    retry_at: DateTime<Utc>,
}

type PendingLoad = Shared<BoxFuture<'static, ResolvedPolicy>>;

struct Inner {
    source: Arc<dyn PolicySource>,
    store: Arc<dyn PolicyStore>,
    clock: Arc<dyn Clock>,
    options: CacheOptions,
    current: RwLock<Option<MemoryEntry>>,
    backoff: RwLock<Option<Backoff>>,
    in_flight: Mutex<HashMap<String, PendingLoad>>,
}

/// Two-tier policy cache with single-flight fetching. Cheap to clone.
#[derive(Clone)]
pub struct PolicyCache {
    inner: Arc<Inner>,
}

impl PolicyCache {
    /// Create a cache on the system clock.
    pub fn new(source: Arc<dyn PolicySource>, store: Arc<dyn PolicyStore>, options: CacheOptions) -> Self {
        Self::with_clock(source, store, options, clock::system())
    }

    /// Create a cache on the given clock.
    pub fn with_clock(
        source: Arc<dyn PolicySource>,
        store: Arc<dyn PolicyStore>,
        options: CacheOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                store,
                clock,
                options,
                current: RwLock::new(None),
                backoff: RwLock::new(None),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The current policy.
    pub async fn get_config(&self) -> Arc<PolicyDocument> {
        self.resolve().await.document
    }

    /// The current policy and where it came from.
    pub async fn resolve(&self) -> ResolvedPolicy {
        let now = self.inner.clock.now();
        let current = self.inner.current.read().clone();
        if let Some(entry) = current {
            if now - entry.fetched_at < to_chrono(self.inner.options.ttl) {
                return ResolvedPolicy {
                    document: entry.document,
                    origin: PolicyOrigin::Memory,
                    fetched_at: Some(entry.fetched_at),
                };
            }
        }

        let backoff = self.inner.backoff.read().clone();
        if let Some(backoff) = backoff {
            if now < backoff.retry_at {
                debug!(origin = %backoff.resolved.origin, retry_at = %backoff.retry_at, "Backing off policy fetch");
                return backoff.resolved;
            }
        }

        self.single_flight(CACHE_KEY.to_string(), false).await
    }

    /// Fetch a new policy, skipping both cache tiers and any retry backoff.
    /// Failures fall back exactly as in [`get_config`](Self::get_config).
    pub async fn refresh_config(&self) -> Arc<PolicyDocument> {
        self.single_flight(format!("{}#refresh", CACHE_KEY), true)
            .await
            .document
    }

    /// Drop both cache tiers.
    pub async fn clear_cache(&self) -> Result<()> {
        *self.inner.current.write() = None;
        *self.inner.backoff.write() = None;
        self.inner.store.remove(CACHE_KEY).await?;
        info!("Policy cache cleared");
        Ok(())
    }

    async fn single_flight(&self, flight: String, force: bool) -> ResolvedPolicy {
        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&flight) {
                Some(pending) => {
                    debug!(flight = %flight, "Joining in-flight policy load");
                    pending.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let key = flight.clone();
                    let pending = async move {
                        let resolved = inner.load(force).await;
                        inner.in_flight.lock().remove(&key);
                        resolved
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(flight, pending.clone());
                    pending
                }
            }
        };

        pending.await
    }
}

impl Inner {
    #[instrument(skip(self), fields(platform = %self.options.platform))]
    async fn load(&self, force: bool) -> ResolvedPolicy {
        let resolved = self.load_uncached(force).await;

        let mut backoff = self.backoff.write();
        match resolved.origin {
            PolicyOrigin::Stale | PolicyOrigin::FailSafe => {
                *backoff = Some(Backoff {
                    resolved: resolved.clone(),
                    retry_at: self.clock.now() + to_chrono(self.options.retry_backoff),
                });
            }
            PolicyOrigin::Fetched => *backoff = None,
            PolicyOrigin::Memory | PolicyOrigin::Persisted => {}
        }

        resolved
    }

    async fn load_uncached(&self, force: bool) -> ResolvedPolicy {
        let persisted = match self.read_persisted().await {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted policy");
                None
            }
        };

        if !force {
            if let Some(cached) = &persisted {
                if cached.is_fresh(self.clock.now(), self.options.ttl) {
                    debug!(fetched_at = %cached.fetched_at, "Serving persisted policy");
                    return self.remember(cached.clone(), PolicyOrigin::Persisted);
                }
            }
        }

        match self.fetch().await {
            Ok(document) => {
                let cached = CachedPolicy {
                    document,
                    fetched_at: self.clock.now(),
                };
                if let Err(e) = self.write_persisted(&cached).await {
                    warn!(error = %e, "Failed to persist policy");
                }
                info!(mode = ?cached.document.mode(), "Fetched policy");
                self.remember(cached, PolicyOrigin::Fetched)
            }
            Err(e) => match persisted {
                Some(cached) => {
                    warn!(error = %e, fetched_at = %cached.fetched_at, "Policy fetch failed, serving stale policy");
                    self.remember(cached, PolicyOrigin::Stale)
                }
                None => {
                    warn!(error = %e, "Policy fetch failed with nothing cached, serving fail-safe policy");
                    ResolvedPolicy {
                        document: Arc::new(PolicyDocument::fail_safe()),
                        origin: PolicyOrigin::FailSafe,
                        fetched_at: None,
                    }
                }
            },
        }
    }

    async fn fetch(&self) -> Result<PolicyDocument> {
        let timeout = self.options.fetch_timeout;
        match tokio::time::timeout(timeout, self.source.fetch(self.options.platform)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GatekeeperError::PolicyFetch(FetchError::Timeout(timeout))),
        }
    }

    fn remember(&self, cached: CachedPolicy, origin: PolicyOrigin) -> ResolvedPolicy {
        let entry = MemoryEntry {
            document: Arc::new(cached.document),
            fetched_at: cached.fetched_at,
        };
        *self.current.write() = Some(entry.clone());

        ResolvedPolicy {
            document: entry.document,
            origin,
            fetched_at: Some(entry.fetched_at),
        }
    }

    async fn read_persisted(&self) -> Result<Option<CachedPolicy>> {
        let Some(raw) = self.store.load(CACHE_KEY).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn write_persisted(&self, cached: &CachedPolicy) -> Result<()> {
        let raw = serde_json::to_string(cached)?;
        self.store.save(CACHE_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::entitlement::persist::MemoryPolicyStore;
    use crate::entitlement::policy::StrategyMode;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        failing: AtomicBool,
        delay: Duration,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Self::slow(Duration::ZERO)
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    fn soft_policy() -> PolicyDocument {
        PolicyDocument::from_json(r#"{"strategy": {"id": "SOFT", "mode": "soft"}, "trial": {"type": "none"}}"#)
            .unwrap()
    }

    #[async_trait]
    impl PolicySource for FakeSource {
        async fn fetch(&self, _platform: Platform) -> std::result::Result<PolicyDocument, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(FetchError::Status(500));
            }
            Ok(soft_policy())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn cache_with(source: Arc<FakeSource>, store: Arc<MemoryPolicyStore>, clock: &ManualClock) -> PolicyCache {
        PolicyCache::with_clock(source, store, CacheOptions::default(), Arc::new(clock.clone()))
    }

    async fn seed(store: &MemoryPolicyStore, fetched_at: DateTime<Utc>) {
        let cached = CachedPolicy {
            document: PolicyDocument::from_json(r#"{"strategy": {"id": "PERSISTED", "mode": "hard-soft"}}"#).unwrap(),
            fetched_at,
        };
        store
            .save(CACHE_KEY, &serde_json::to_string(&cached).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_memory_cache_within_ttl() {
        let clock = ManualClock::new(start());
        let source = FakeSource::new();
        let cache = cache_with(source.clone(), Arc::new(MemoryPolicyStore::new()), &clock);

        let first = cache.resolve().await;
        assert_eq!(first.origin, PolicyOrigin::Fetched);
        assert_eq!(first.document.mode(), Some(StrategyMode::Soft));

        clock.advance(Duration::from_secs(59 * 60));
        let second = cache.resolve().await;
        assert_eq!(second.origin, PolicyOrigin::Memory);
        assert_eq!(source.calls(), 1);

        clock.advance(Duration::from_secs(60));
        let third = cache.resolve().await;
        assert_eq!(third.origin, PolicyOrigin::Fetched);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_fetch_is_persisted() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        let cache = cache_with(FakeSource::new(), store.clone(), &clock);

        cache.get_config().await;

        let raw = store.load(CACHE_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["document"]["strategy"]["id"], "SOFT");
        assert!(value["fetchedAt"].is_string());

        let cached: CachedPolicy = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached.fetched_at, start());
    }

    #[tokio::test]
    async fn test_fresh_persisted_copy_skips_fetch() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        seed(&store, start() - chrono::Duration::minutes(30)).await;
        let source = FakeSource::new();
        let cache = cache_with(source.clone(), store, &clock);

        let resolved = cache.resolve().await;
        assert_eq!(resolved.origin, PolicyOrigin::Persisted);
        assert_eq!(resolved.document.mode(), Some(StrategyMode::HardSoft));
        assert_eq!(source.calls(), 0);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Memory);
    }

    #[tokio::test]
    async fn test_expired_persisted_copy_is_refetched() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        seed(&store, start() - chrono::Duration::hours(2)).await;
        let source = FakeSource::new();
        let cache = cache_with(source.clone(), store, &clock);

        let resolved = cache.resolve().await;
        assert_eq!(resolved.origin, PolicyOrigin::Fetched);
        assert_eq!(resolved.document.mode(), Some(StrategyMode::Soft));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_serves_stale_persisted_copy() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        seed(&store, start() - chrono::Duration::days(3)).await;
        let source = FakeSource::new();
        source.fail(true);
        let cache = cache_with(source.clone(), store, &clock);

        let resolved = cache.resolve().await;
        assert_eq!(resolved.origin, PolicyOrigin::Stale);
        assert_eq!(resolved.document.mode(), Some(StrategyMode::HardSoft));

        // Stale entries never count as fresh, so the next call after the backoff retries
        source.fail(false);
        clock.advance(DEFAULT_RETRY_BACKOFF);
        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Fetched);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_with_nothing_cached_serves_fail_safe() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        let source = FakeSource::new();
        source.fail(true);
        let cache = cache_with(source.clone(), store.clone(), &clock);

        let resolved = cache.resolve().await;
        assert_eq!(resolved.origin, PolicyOrigin::FailSafe);
        assert_eq!(*resolved.document, PolicyDocument::fail_safe());
        assert!(resolved.fetched_at.is_none());
        assert_eq!(store.load(CACHE_KEY).await.unwrap(), None);

        clock.advance(DEFAULT_RETRY_BACKOFF);
        assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_backs_off() {
        let clock = ManualClock::new(start());
        let source = FakeSource::new();
        source.fail(true);
        let cache = cache_with(source.clone(), Arc::new(MemoryPolicyStore::new()), &clock);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);
        assert_eq!(source.calls(), 1);

        // Within the backoff the fallback is served without touching the network
        source.fail(false);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(5));
            assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);
        }
        assert_eq!(source.calls(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Fetched);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_ignores_backoff() {
        let clock = ManualClock::new(start());
        let source = FakeSource::new();
        source.fail(true);
        let cache = cache_with(source.clone(), Arc::new(MemoryPolicyStore::new()), &clock);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);

        source.fail(false);
        assert_eq!(cache.refresh_config().await.mode(), Some(StrategyMode::Soft));
        assert_eq!(source.calls(), 2);
        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Memory);
    }

    #[tokio::test]
    async fn test_zero_backoff_retries_every_call() {
        let clock = ManualClock::new(start());
        let source = FakeSource::new();
        source.fail(true);
        let cache = PolicyCache::with_clock(
            source.clone(),
            Arc::new(MemoryPolicyStore::new()),
            CacheOptions {
                retry_backoff: Duration::ZERO,
                ..CacheOptions::default()
            },
            Arc::new(clock.clone()),
        );

        cache.resolve().await;
        cache.resolve().await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_persisted_copy_is_ignored() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        store.save(CACHE_KEY, "{not json").await.unwrap();
        let source = FakeSource::new();
        source.fail(true);
        let cache = cache_with(source, store, &clock);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);
    }

    #[tokio::test]
    async fn test_persisted_copy_errors() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        store.save(CACHE_KEY, "{not json").await.unwrap();
        let cache = cache_with(FakeSource::new(), store, &clock);

        let err = cache.inner.read_persisted().await.unwrap_err();
        assert!(matches!(err, GatekeeperError::Json(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_a_fetch_error() {
        let source = FakeSource::slow(Duration::from_millis(500));
        let cache = PolicyCache::new(
            source,
            Arc::new(MemoryPolicyStore::new()),
            CacheOptions {
                fetch_timeout: Duration::from_millis(50),
                ..CacheOptions::default()
            },
        );

        let err = cache.inner.fetch().await.unwrap_err();
        assert!(matches!(err, GatekeeperError::PolicyFetch(FetchError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let source = FakeSource::slow(Duration::from_millis(100));
        let cache = PolicyCache::new(
            source.clone(),
            Arc::new(MemoryPolicyStore::new()),
            CacheOptions::default(),
        );

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_config().await }));
        }

        for handle in handles {
            let document = handle.await.unwrap();
            assert_eq!(document.mode(), Some(StrategyMode::Soft));
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let source = FakeSource::slow(Duration::from_millis(500));
        let cache = PolicyCache::new(
            source,
            Arc::new(MemoryPolicyStore::new()),
            CacheOptions {
                fetch_timeout: Duration::from_millis(50),
                ..CacheOptions::default()
            },
        );

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::FailSafe);
    }

    #[tokio::test]
    async fn test_refresh_bypasses_caches() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        seed(&store, start()).await;
        let source = FakeSource::new();
        let cache = cache_with(source.clone(), store, &clock);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Persisted);
        assert_eq!(source.calls(), 0);

        let refreshed = cache.refresh_config().await;
        assert_eq!(refreshed.mode(), Some(StrategyMode::Soft));
        assert_eq!(source.calls(), 1);

        let after = cache.resolve().await;
        assert_eq!(after.origin, PolicyOrigin::Memory);
        assert_eq!(after.document.mode(), Some(StrategyMode::Soft));
    }

    #[tokio::test]
    async fn test_clear_cache() {
        let clock = ManualClock::new(start());
        let store = Arc::new(MemoryPolicyStore::new());
        let source = FakeSource::new();
        let cache = cache_with(source.clone(), store.clone(), &clock);

        cache.get_config().await;
        cache.clear_cache().await.unwrap();
        assert_eq!(store.load(CACHE_KEY).await.unwrap(), None);

        assert_eq!(cache.resolve().await.origin, PolicyOrigin::Fetched);
        assert_eq!(source.calls(), 2);
    }
}
