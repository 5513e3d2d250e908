//! Stale-while-revalidate cache for one resource.
//!
//! [`OfflineCache::read`] always answers immediately with the last known
//! value. [`OfflineCache::refresh`] revalidates in the background:
//! - while offline or while data is fresh, a non-forced refresh does nothing
//! - a forced refresh always goes to the network
//! - failures keep the previous data and only record the error
//!
//! At most one refresh runs per cache. Each refresh is tagged with a sequence
//! number; a completion older than the last applied one (or than the last
//! [`OfflineCache::clear`]) is dropped.

use crate::cache::storage::{is_expired, read_entry, write_entry, CacheEntry, DynStore};
use crate::clock::{elapsed_between, DynClock};
use crate::error::{RequestError, TallyError};
use crate::network::{ConnectivityMonitor, RequestExecutor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Loads the current value of a resource from the backend.
#[async_trait]
pub trait ResourceFetcher<T>: Send + Sync {
    async fn fetch(&self) -> std::result::Result<T, RequestError>;
}

/// Fetches a resource with a GET on its endpoint.
pub struct EndpointFetcher {
    executor: Arc<RequestExecutor>,
    path: String,
}

impl EndpointFetcher {
    pub fn new(executor: Arc<RequestExecutor>, path: impl Into<String>) -> Self {
        Self {
            executor,
            path: path.into(),
        }
    }
}

#[async_trait]
impl<T> ResourceFetcher<T> for EndpointFetcher
where
    T: DeserializeOwned + Send + 'static,
{
    async fn fetch(&self) -> std::result::Result<T, RequestError> {
        self.executor.get_json(&self.path).await
    }
}

/// Adapts an async closure into a [`ResourceFetcher`].
pub struct FnFetcher<F>(pub F);

#[async_trait]
impl<T, F, Fut> ResourceFetcher<T> for FnFetcher<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, RequestError>> + Send,
{
    async fn fetch(&self) -> std::result::Result<T, RequestError> {
        (self.0)().await
    }
}

/// What a cache exposes to the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchState<T> {
    pub data: Option<T>,
    pub is_loading: bool,
    pub is_online: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl<T> Default for FetchState<T> {
    fn default() -> Self {
        Self {
            data: None,
            is_loading: false,
            is_online: true,
            last_updated: None,
            error: None,
        }
    }
}

impl<T> FetchState<T> {
    /// Data is shown but the last refresh failed.
    pub fn is_stale_with_error(&self) -> bool {
        self.data.is_some() && self.error.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }
}

/// Why a non-forced refresh did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    Fresh,
}

/// Result of one [`OfflineCache::refresh`] call.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// New data was stored and published.
    Applied,
    /// The fetch failed; previous data is kept.
    Failed(RequestError),
    /// Another refresh was already running; no network call was made.
    Coalesced,
    /// The fetch completed after a newer refresh or a clear and was dropped.
    Discarded,
    Skipped(SkipReason),
}

impl RefreshOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RefreshOutcome::Applied)
    }
}

/// Per-resource offline cache.
pub struct OfflineCache<T> {
    key: String,
    ttl: Duration,
    fetcher: Arc<dyn ResourceFetcher<T>>,
    store: DynStore,
    connectivity: Arc<ConnectivityMonitor>,
    clock: DynClock,
    state: watch::Sender<FetchState<T>>,
    /// Sequence of the running refresh, 0 when idle.
    in_flight: AtomicU64,
    next_sequence: AtomicU64,
    /// Highest sequence applied or invalidated by a clear.
    applied_sequence: AtomicU64,
}

/// Releases the in-flight marker unless a clear already took it.
///
/// A refresh dropped mid-fetch still owns the marker here, so the guard also
/// takes down the loading flag it published.
struct InFlightGuard<'a, T> {
    slot: &'a AtomicU64,
    sequence: u64,
    state: &'a watch::Sender<FetchState<T>>,
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        let released = self
            .slot
            .compare_exchange(self.sequence, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if released {
            self.state
                .send_if_modified(|state| std::mem::take(&mut state.is_loading));
        }
    }
}

impl<T> OfflineCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create the cache and seed it from durable storage.
    ///
    /// Only an unexpired stored entry is used; nothing touches the network here.
    pub fn new(
        key: impl Into<String>,
        ttl: Duration,
        fetcher: Arc<dyn ResourceFetcher<T>>,
        store: DynStore,
        connectivity: Arc<ConnectivityMonitor>,
        clock: DynClock,
    ) -> Self {
        let key = key.into();
        let mut initial = FetchState {
            is_online: connectivity.is_online(),
            ..FetchState::default()
        };

        let now = clock.now();
        match read_entry::<T>(store.as_ref(), &key) {
            // The entry must be young enough for both its own TTL and this cache's.
            Ok(Some(entry)) if !is_expired(&entry, now) && entry.age(now) < ttl => {
                debug!(resource = %key, fetched_at = %entry.fetched_at, "Seeded from durable cache");
                initial.data = Some(entry.value);
                initial.last_updated = Some(entry.fetched_at);
            }
            Ok(Some(entry)) => {
                debug!(resource = %key, fetched_at = %entry.fetched_at, "Stored entry expired, not seeding");
            }
            Ok(None) => {}
            Err(e) => {
                let e = as_cache_read(&key, e);
                warn!(resource = %key, "{}", e);
            }
        }

        let (state, _) = watch::channel(initial);

        Self {
            key,
            ttl,
            fetcher,
            store,
            connectivity,
            clock,
            state,
            in_flight: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
            applied_sequence: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current state snapshot. Never blocks on the network.
    pub fn read(&self) -> FetchState<T> {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<FetchState<T>> {
        self.state.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) != 0
    }

    /// Data is present and younger than the TTL.
    pub fn is_fresh(&self) -> bool {
        let now = self.clock.now();
        let state = self.state.borrow();
        state.data.is_some()
            && state
                .last_updated
                .is_some_and(|at| elapsed_between(at, now) < self.ttl)
    }

    /// Revalidate from the backend.
    ///
    /// With `force == false` this is a no-op while offline or while data is
    /// fresh. With `force == true` the fetch always runs.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        if !force {
            if !self.connectivity.is_online() {
                debug!(resource = %self.key, "Offline, skipping refresh");
                return RefreshOutcome::Skipped(SkipReason::Offline);
            }
            if self.is_fresh() {
                debug!(resource = %self.key, "Data fresh, skipping refresh");
                return RefreshOutcome::Skipped(SkipReason::Fresh);
            }
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .in_flight
            .compare_exchange(0, sequence, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(resource = %self.key, "Refresh already in flight, coalescing");
            return RefreshOutcome::Coalesced;
        }
        let _guard = InFlightGuard {
            slot: &self.in_flight,
            sequence,
            state: &self.state,
        };

        let online = self.connectivity.is_online();
        self.state.send_modify(|state| {
            state.is_loading = true;
            state.is_online = online;
        });

        debug!(resource = %self.key, sequence, force, "Refreshing");
        let result = self.fetcher.fetch().await;

        if self.applied_sequence.fetch_max(sequence, Ordering::SeqCst) >= sequence {
            debug!(resource = %self.key, sequence, "Dropping superseded refresh result");
            return RefreshOutcome::Discarded;
        }

        match result {
            Ok(value) => {
                self.apply(value);
                RefreshOutcome::Applied
            }
            Err(e) => {
                warn!(
                    resource = %self.key,
                    request_id = %e.request_id,
                    kind = %e.kind,
                    "Refresh failed, keeping cached data: {}",
                    e
                );
                let message = e.message.clone();
                self.state.send_modify(|state| {
                    state.is_loading = false;
                    state.error = Some(message);
                });
                RefreshOutcome::Failed(e)
            }
        }
    }

    /// Persist and publish a fetched value.
    fn apply(&self, value: T) {
        let previous = self.state.borrow().last_updated;
        let now = self.clock.now();
        // fetched_at never moves backwards for a key
        let fetched_at = previous.map_or(now, |prev| prev.max(now));

        let entry = CacheEntry::new(self.key.clone(), value, fetched_at, self.ttl);
        if let Err(e) = write_entry(self.store.as_ref(), &entry) {
            let e = as_cache_write(&self.key, e);
            warn!(resource = %self.key, "{}", e);
        }

        self.state.send_modify(|state| {
            state.data = Some(entry.value);
            state.last_updated = Some(fetched_at);
            state.is_loading = false;
            state.error = None;
        });
        info!(resource = %self.key, "Cache updated");
    }

    /// Drop the durable entry and reset the state.
    ///
    /// A refresh still running is discarded when it completes.
    pub fn clear(&self) {
        let marker = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.applied_sequence.fetch_max(marker, Ordering::SeqCst);
        self.in_flight.store(0, Ordering::SeqCst);

        if let Err(e) = self.store.delete(&self.key) {
            let e = as_cache_write(&self.key, e);
            warn!(resource = %self.key, "{}", e);
        }

        self.state.send_modify(|state| {
            *state = FetchState {
                is_online: state.is_online,
                ..FetchState::default()
            };
        });
        info!(resource = %self.key, "Cache cleared");
    }

    fn needs_refresh(&self) -> bool {
        !self.is_fresh()
    }

    /// Follow the connectivity signal.
    ///
    /// Mirrors it into `is_online` and, on a transition to online, refreshes
    /// when data is missing or stale. The task ends once the cache is dropped
    /// and the next signal arrives.
    pub fn spawn_connectivity_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.connectivity.subscribe();
        let mut was_online = rx.borrow_and_update().is_online();
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = rx.borrow_and_update().is_online();
                let Some(cache) = weak.upgrade() else {
                    break;
                };

                cache.state.send_if_modified(|state| {
                    let changed = state.is_online != online;
                    state.is_online = online;
                    changed
                });

                if online && !was_online && cache.needs_refresh() {
                    info!(resource = %cache.key, "Back online, revalidating");
                    cache.refresh(false).await;
                }

                was_online = online;
            }
        })
    }
}

fn as_cache_read(key: &str, err: TallyError) -> TallyError {
    match err {
        TallyError::CacheRead { .. } => err,
        other => TallyError::CacheRead {
            key: key.to_string(),
            message: other.to_string(),
        },
    }
}

fn as_cache_write(key: &str, err: TallyError) -> TallyError {
    match err {
        TallyError::CacheWrite { .. } => err,
        other => TallyError::CacheWrite {
            key: key.to_string(),
            message: other.to_string(),
        },
    }
}
