//! Tally Core - resilient client-side data access for the Tally budgeting app.
//!
//! This crate provides the layer between UI code and the Tally REST backend:
//! - [`RequestExecutor`]: timeout, retry with backoff, auth headers and typed errors
//! - [`OfflineCache`]: stale-while-revalidate caching that keeps data usable offline
//! - [`RateLimiter`]: sliding-window throttling for sensitive actions such as login
//!
//! # Example
//!
//! ```rust,ignore
//! use tally_core::{ClientConfig, Resource, TallyClient};
//!
//! #[tokio::main]
//! async fn main() -> tally_core::Result<()> {
//!     let client = TallyClient::from_config(ClientConfig::load(None)?)?;
//!
//!     // Cached value first, then revalidate
//!     let state = client.read(Resource::Budgets);
//!     println!("cached: {:?}", state.data);
//!
//!     client.refresh(Resource::Budgets, false).await;
//!     println!("fresh: {:?}", client.read(Resource::Budgets).data);
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod rate_limit;
pub mod resources;

// Re-export commonly used types
pub use auth::{AuthEvent, AuthHeader, AuthSession, CredentialStore, MemoryCredentialStore};
pub use cache::{
    CacheEntry, CacheStore, FetchState, MemoryStore, OfflineCache, RefreshOutcome, SqliteStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, Environment};
pub use error::{RequestError, RequestErrorKind, Result, TallyError};
pub use network::{ConnectivityMonitor, ConnectivityProbe, ConnectivityState, RequestExecutor};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use resources::{Resource, TallyClient};
