//! Counter store contract and the in-process reference store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::counter::CounterRecord;
use crate::clock::{self, Clock};

/// Errors raised by a backing counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store operation failed: {0}")]
    Operation(String),
}

/// Outcome of an atomic admission attempt against a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquisition {
    /// The record after the attempt (unchanged when not admitted)
    pub record: CounterRecord,
    /// Whether the request was counted against the window
    pub admitted: bool,
}

/// Key to window-counter storage.
///
/// Implementations must make read-modify-write on a single key atomic with
/// respect to concurrent callers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the live record for a key. Expired records read as absent.
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError>;

    /// Count one request, opening a fresh window when the key is absent or
    /// its window has elapsed.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError>;

    /// Remove every record whose window has elapsed. Returns how many were removed.
    async fn cleanup(&self) -> Result<usize, StoreError>;

    /// Count one request only if the key is below `max_requests` in its
    /// current window.
    ///
    /// The default composes `get` and `increment` and is only as atomic as
    /// those two calls; stores that can do better should override it.
    async fn acquire(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<Acquisition, StoreError> {
        match self.get(key).await? {
            Some(record) if record.count >= max_requests => Ok(Acquisition {
                record,
                admitted: false,
            }),
            _ => Ok(Acquisition {
                record: self.increment(key, window).await?,
                admitted: true,
            }),
        }
    }
}

/// In-process counter store.
///
/// Counters live in a sharded concurrent map, so every process has its own
/// independent view. Deployments with more than one process need an
/// externally atomic store.
pub struct MemoryCounterStore {
    counters: DashMap<String, CounterRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(clock::system())
    }

    /// Create an empty store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
        }
    }

    /// Number of records held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<CounterRecord>, StoreError> {
        let now = self.clock.now();
        let record = self.counters.get(key).map(|r| *r);

        match record {
            Some(record) if record.is_expired_at(now) => {
                self.counters.remove_if(key, |_, r| r.is_expired_at(now));
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<CounterRecord, StoreError> {
        let now = self.clock.now();

        let record = match self.counters.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired_at(now) {
                    *record = CounterRecord::open(now, window);
                } else {
                    record.count += 1;
                }
                *record
            }
            Entry::Vacant(vacant) => *vacant.insert(CounterRecord::open(now, window)),
        };

        trace!(key = %key, count = record.count, "Incremented counter");
        Ok(record)
    }

    async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut removed = 0;

        self.counters.retain(|_, record| {
            let live = !record.is_expired_at(now);
            if !live {
                removed += 1;
            }
            live
        });

        Ok(removed)
    }

    async fn acquire(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> Result<Acquisition, StoreError> {
        let now = self.clock.now();

        // The entry guard holds the shard lock for the whole decision.
        let acquisition = match self.counters.entry(key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_expired_at(now) {
                    *record = CounterRecord::open(now, window);
                    Acquisition {
                        record: *record,
                        admitted: true,
                    }
                } else if record.count < max_requests {
                    record.count += 1;
                    Acquisition {
                        record: *record,
                        admitted: true,
                    }
                } else {
                    Acquisition {
                        record: *record,
                        admitted: false,
                    }
                }
            }
            Entry::Vacant(vacant) => Acquisition {
                record: *vacant.insert(CounterRecord::open(now, window)),
                admitted: true,
            },
        };

        Ok(acquisition)
    }
}

/// Counter store implementations selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map
    #[default]
    Memory,
}

impl StoreBackend {
    /// Build the configured store.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Arc<dyn CounterStore> {
        match self {
            StoreBackend::Memory => Arc::new(MemoryCounterStore::with_clock(clock)),
        }
    }
}

/// Run `cleanup` on `store` every `every` until the handle is aborted.
pub fn spawn_cleanup<S>(store: Arc<S>, every: Duration) -> JoinHandle<()>
where
    S: CounterStore + ?Sized + 'static,
{
    info!(interval_ms = every.as_millis() as u64, "Starting counter sweeper");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store.cleanup().await {
                Ok(0) => {}
                Ok(removed) => debug!(removed = removed, "Swept expired counters"),
                Err(e) => warn!(error = %e, "Counter sweep failed"),
            }
        }
    })
}
