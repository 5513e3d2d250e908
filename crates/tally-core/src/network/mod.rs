//! Network layer: transport boundary, retry policy, request executor and
//! connectivity signal.

pub mod client;
pub mod connectivity;
pub mod retry;
pub mod transport;

pub use client::{RateLimitState, RequestExecutor};
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, ConnectivityState};
pub use retry::{retry_async, AttemptOutcome, RetryConfig, RetryHint, RetryStats, RetryStep};
pub use transport::{
    DynTransport, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError,
};
