//! Budgeting resources and the client facade that wires everything together.

use crate::auth::AuthSession;
use crate::cache::{DynStore, EndpointFetcher, FetchState, OfflineCache, RefreshOutcome, SqliteStore};
use crate::clock::{DynClock, SystemClock};
use crate::config::{CacheDefaults, ClientConfig, NetworkConfig, RateLimitDefaults};
use crate::error::{Result, TallyError};
use crate::network::{ConnectivityMonitor, RequestExecutor};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A cached backend collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Budgets,
    Transactions,
    Goals,
    Accounts,
    Categories,
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Budgets,
        Resource::Transactions,
        Resource::Goals,
        Resource::Accounts,
        Resource::Categories,
    ];

    /// Durable storage key.
    pub fn key(&self) -> &'static str {
        match self {
            Resource::Budgets => "budgets",
            Resource::Transactions => "transactions",
            Resource::Goals => "goals",
            Resource::Accounts => "accounts",
            Resource::Categories => "categories",
        }
    }

    pub fn endpoint(&self) -> &'static str {
        match self {
            Resource::Budgets => "/api/budgets",
            Resource::Transactions => "/api/transactions",
            Resource::Goals => "/api/goals",
            Resource::Accounts => "/api/accounts",
            Resource::Categories => "/api/categories",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            Resource::Budgets => CacheDefaults::BUDGETS_TTL,
            Resource::Transactions => CacheDefaults::TRANSACTIONS_TTL,
            Resource::Goals => CacheDefaults::GOALS_TTL,
            Resource::Accounts => CacheDefaults::ACCOUNTS_TTL,
            Resource::Categories => CacheDefaults::CATEGORIES_TTL,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Resource {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Resource::ALL
            .into_iter()
            .find(|r| r.key() == wanted)
            .ok_or_else(|| TallyError::Validation {
                field: "resource".to_string(),
                message: format!("unknown resource '{}'", s),
            })
    }
}

/// One executor, one session, one connectivity signal, one rate limiter and
/// an offline cache per resource.
pub struct TallyClient {
    config: ClientConfig,
    executor: Arc<RequestExecutor>,
    auth: Arc<AuthSession>,
    connectivity: Arc<ConnectivityMonitor>,
    limiter: Arc<RateLimiter>,
    store: DynStore,
    clock: DynClock,
    caches: Mutex<HashMap<Resource, Arc<OfflineCache<Value>>>>,
    /// Connectivity listeners, aborted when the client is dropped.
    listeners: Mutex<HashMap<Resource, JoinHandle<()>>>,
}

impl TallyClient {
    pub fn new(
        config: ClientConfig,
        executor: Arc<RequestExecutor>,
        store: DynStore,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig::auth()).with_action(
            RateLimitDefaults::AUTH_ACTION,
            RateLimitConfig::from(&config.auth_rate_limit),
        );

        Self {
            auth: Arc::clone(executor.auth()),
            config,
            executor,
            connectivity,
            limiter: Arc::new(limiter),
            store,
            clock: Arc::new(SystemClock),
            caches: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: reqwest transport, SQLite cache, token from `TALLY_TOKEN`.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let auth = AuthSession::in_memory().with_dev_user_id(config.dev_user_id.clone());
        if let Some(token) = ClientConfig::token_from_env() {
            auth.login(token);
        }

        let executor = RequestExecutor::from_config(&config, Arc::new(auth))?;
        let store = SqliteStore::new(config.cache_db_path()?)?;

        Ok(Self::new(
            config,
            Arc::new(executor),
            Arc::new(store),
            Arc::new(ConnectivityMonitor::default()),
        ))
    }

    /// Replace the clock used by caches and the rate limiter.
    ///
    /// Call before the first cache is created.
    pub fn with_clock(mut self, clock: DynClock) -> Self {
        let limiter = RateLimiter::new(RateLimitConfig::auth())
            .with_action(
                RateLimitDefaults::AUTH_ACTION,
                RateLimitConfig::from(&self.config.auth_rate_limit),
            )
            .with_clock(clock.clone());
        self.limiter = Arc::new(limiter);
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Effective TTL for a resource after config overrides.
    pub fn ttl_for(&self, resource: Resource) -> Duration {
        self.config
            .ttl_override(resource.key())
            .unwrap_or_else(|| resource.default_ttl())
    }

    /// The cache for a resource, created (and seeded from storage) on first use.
    ///
    /// The cache follows connectivity from the first call made inside a tokio
    /// runtime.
    pub fn cache(&self, resource: Resource) -> Arc<OfflineCache<Value>> {
        let cache = self.cache_entry(resource);
        self.follow_connectivity(resource, &cache);
        cache
    }

    fn cache_entry(&self, resource: Resource) -> Arc<OfflineCache<Value>> {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());

        Arc::clone(caches.entry(resource).or_insert_with(|| {
            let fetcher = Arc::new(EndpointFetcher::new(
                Arc::clone(&self.executor),
                resource.endpoint(),
            ));
            Arc::new(OfflineCache::new(
                resource.key(),
                self.ttl_for(resource),
                fetcher,
                Arc::clone(&self.store),
                Arc::clone(&self.connectivity),
                Arc::clone(&self.clock),
            ))
        }))
    }

    fn follow_connectivity(&self, resource: Resource, cache: &Arc<OfflineCache<Value>>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(&resource) {
            return;
        }

        if tokio::runtime::Handle::try_current().is_ok() {
            listeners.insert(resource, cache.spawn_connectivity_listener());
        } else {
            debug!(resource = %resource, "No tokio runtime yet, connectivity listener deferred");
        }
    }

    pub fn read(&self, resource: Resource) -> FetchState<Value> {
        self.cache(resource).read()
    }

    pub async fn refresh(&self, resource: Resource, force: bool) -> RefreshOutcome {
        self.cache(resource).refresh(force).await
    }

    /// Refresh every resource concurrently.
    pub async fn refresh_all(&self, force: bool) -> Vec<(Resource, RefreshOutcome)> {
        let refreshes = Resource::ALL.into_iter().map(|resource| async move {
            (resource, self.refresh(resource, force).await)
        });
        join_all(refreshes).await
    }

    pub fn clear(&self, resource: Resource) {
        self.cache(resource).clear();
    }

    /// Keys currently held in durable storage.
    pub fn cached_keys(&self) -> Result<Vec<String>> {
        self.store.keys()
    }

    /// Check the stored credential against the backend, throttled by the
    /// `auth` rate limit. A successful check resets the limit.
    pub async fn login_attempt(&self) -> Result<Option<Value>> {
        let action = RateLimitDefaults::AUTH_ACTION;

        if self.limiter.is_limited(action) {
            let remaining = self.limiter.remaining_block_duration(action);
            warn!("Login blocked for another {:?}", remaining);
            return Err(TallyError::Throttled {
                action: action.to_string(),
                retry_in_secs: remaining.as_secs(),
            });
        }

        self.limiter.record_attempt(action);

        let payload = self.executor.get(NetworkConfig::LOGIN_CHECK_PATH).await?;
        self.limiter.reset(action);
        info!("Login check succeeded");
        Ok(payload)
    }
}

impl Drop for TallyClient {
    fn drop(&mut self) {
        let listeners = self.listeners.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::cache::MemoryStore;
    use crate::clock::ManualClock;
    use crate::error::RequestErrorKind;
    use crate::network::{HttpRequest, HttpResponse, HttpTransport, RetryConfig, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers every request with the same status, JSON body `{"path": ...}`.
    struct EchoTransport {
        status: u16,
        calls: AtomicU32,
    }

    #[async_trait]
    impl HttpTransport for EchoTransport {
        async fn send(
            &self,
            request: HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let path = request.url.trim_start_matches("https://api.tally.test");
            Ok(HttpResponse::json(self.status, &json!({ "path": path })))
        }
    }

    fn client(status: u16) -> (TallyClient, Arc<EchoTransport>, ManualClock) {
        let transport = Arc::new(EchoTransport {
            status,
            calls: AtomicU32::new(0),
        });
        let auth = Arc::new(AuthSession::new(Arc::new(MemoryCredentialStore::with_token(
            "tok",
        ))));
        let executor = RequestExecutor::new("https://api.tally.test", transport.clone(), auth)
            .unwrap()
            .with_retry(RetryConfig::none());
        let clock = ManualClock::default();

        let mut config = ClientConfig::default();
        config.ttl_overrides.insert("goals".to_string(), 42);

        let client = TallyClient::new(
            config,
            Arc::new(executor),
            Arc::new(MemoryStore::new()),
            Arc::new(ConnectivityMonitor::default()),
        )
        .with_clock(Arc::new(clock.clone()));

        (client, transport, clock)
    }

    #[test]
    fn test_resource_table() {
        assert_eq!(Resource::Transactions.default_ttl(), Duration::from_secs(120));
        assert_eq!(Resource::Budgets.default_ttl(), Duration::from_secs(300));
        assert_eq!(Resource::Categories.endpoint(), "/api/categories");
        assert_eq!("Accounts".parse::<Resource>().unwrap(), Resource::Accounts);
        assert!("loans".parse::<Resource>().is_err());
    }

    #[tokio::test]
    async fn test_ttl_override_applies() {
        let (client, _, _) = client(200);
        assert_eq!(client.ttl_for(Resource::Goals), Duration::from_secs(42));
        assert_eq!(client.cache(Resource::Goals).ttl(), Duration::from_secs(42));
        assert_eq!(client.ttl_for(Resource::Budgets), CacheDefaults::BUDGETS_TTL);
    }

    #[tokio::test]
    async fn test_refresh_uses_resource_endpoint() {
        let (client, transport, _) = client(200);

        assert!(client.refresh(Resource::Budgets, false).await.is_applied());

        assert_eq!(
            client.read(Resource::Budgets).data,
            Some(json!({ "path": "/api/budgets" }))
        );
        assert_eq!(client.cached_keys().unwrap(), vec!["budgets"]);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(
            &client.cache(Resource::Budgets),
            &client.cache(Resource::Budgets)
        ));

        client.clear(Resource::Budgets);
        assert!(client.cached_keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_all_covers_every_resource() {
        let (client, transport, _) = client(200);

        let outcomes = client.refresh_all(false).await;

        assert_eq!(outcomes.len(), Resource::ALL.len());
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_applied()));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        assert_eq!(client.cached_keys().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_login_success_resets_limit() {
        let (client, _, _) = client(200);
        client.rate_limiter().record_attempt(RateLimitDefaults::AUTH_ACTION);

        let payload = client.login_attempt().await.unwrap();

        assert_eq!(payload, Some(json!({ "path": "/api/auth/me" })));
        assert_eq!(
            client.rate_limiter().remaining_attempts(RateLimitDefaults::AUTH_ACTION),
            5
        );
    }

    #[tokio::test]
    async fn test_failed_logins_are_throttled() {
        let (client, transport, clock) = client(403);

        for _ in 0..5 {
            let err = client.login_attempt().await.unwrap_err();
            assert_eq!(err.as_request().map(|e| e.kind), Some(RequestErrorKind::Client));
        }

        let err = client.login_attempt().await.unwrap_err();
        assert!(matches!(err, TallyError::Throttled { retry_in_secs: 900, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);

        clock.advance(RateLimitDefaults::AUTH_WINDOW);
        assert!(client.login_attempt().await.is_err());
        assert_eq!(transport.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_cache_created_outside_runtime_follows_connectivity_later() {
        let (client, transport, _) = client(200);
        client.connectivity().set_online(false);
        assert!(client.cache(Resource::Accounts).read().is_empty());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let state = runtime.block_on(async {
            let cache = client.cache(Resource::Accounts);
            let mut updates = cache.subscribe();
            client.connectivity().set_online(true);

            let state = tokio::time::timeout(
                Duration::from_secs(5),
                updates.wait_for(|state| state.data.is_some()),
            )
            .await
            .unwrap()
            .unwrap()
            .clone();
            state
        });

        assert_eq!(state.data, Some(json!({ "path": "/api/accounts" })));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
