//! Offline cache: durable envelopes plus the per-resource
//! stale-while-revalidate state machine.

mod offline;
mod sqlite;
mod storage;

pub use offline::{
    EndpointFetcher, FetchState, FnFetcher, OfflineCache, RefreshOutcome, ResourceFetcher,
    SkipReason,
};
pub use sqlite::SqliteStore;
pub use storage::{
    is_expired, read_entry, write_entry, CacheEntry, CacheStore, DynStore, MemoryStore,
};
