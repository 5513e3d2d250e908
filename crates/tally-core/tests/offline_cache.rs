//! Offline cache behaviour against durable SQLite storage.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tally_core::auth::MemoryCredentialStore;
use tally_core::cache::{write_entry, FnFetcher, RefreshOutcome, SkipReason};
use tally_core::network::{ReqwestTransport, RetryConfig};
use tally_core::{
    AuthSession, CacheEntry, ClientConfig, Clock, ConnectivityMonitor, ConnectivityState,
    ManualClock, OfflineCache, RequestError, RequestExecutor, Resource, SqliteStore, TallyClient,
};
use tempfile::TempDir;

const TTL: Duration = Duration::from_secs(120);

fn counting_fetcher(
    calls: Arc<AtomicU32>,
    value: Value,
) -> Arc<FnFetcher<impl Fn() -> futures::future::Ready<Result<Value, RequestError>> + Send + Sync>>
{
    Arc::new(FnFetcher(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(value.clone()))
    }))
}

#[tokio::test]
async fn test_restart_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("cache.db");
    let clock = ManualClock::default();
    let connectivity = Arc::new(ConnectivityMonitor::new(ConnectivityState::Online));
    let calls = Arc::new(AtomicU32::new(0));
    let value = json!([{ "id": 1, "amount": -42.5, "payee": "Grocer" }]);

    {
        let cache = OfflineCache::new(
            "transactions",
            TTL,
            counting_fetcher(calls.clone(), value.clone()),
            Arc::new(SqliteStore::new(&db_path).unwrap()),
            connectivity.clone(),
            Arc::new(clock.clone()),
        );
        assert!(cache.refresh(true).await.is_applied());
    }

    clock.advance(Duration::from_secs(30));
    let restarted = OfflineCache::new(
        "transactions",
        TTL,
        counting_fetcher(calls.clone(), json!([])),
        Arc::new(SqliteStore::new(&db_path).unwrap()),
        connectivity,
        Arc::new(clock.clone()),
    );

    let state = restarted.read();
    assert_eq!(state.data, Some(value));
    assert!(state.last_updated.is_some());
    assert!(matches!(
        restarted.refresh(false).await,
        RefreshOutcome::Skipped(SkipReason::Fresh)
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cold_start_from_sixty_second_old_entry() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::new(temp_dir.path().join("cache.db")).unwrap());
    let clock = ManualClock::default();
    let fetched_at = clock.now();
    write_entry(
        &*store,
        &CacheEntry::new("budgets", json!({ "rent": 1200 }), fetched_at, TTL),
    )
    .unwrap();
    clock.advance(Duration::from_secs(60));

    let calls = Arc::new(AtomicU32::new(0));
    let cache = OfflineCache::new(
        "budgets",
        TTL,
        counting_fetcher(calls.clone(), json!(null)),
        store,
        Arc::new(ConnectivityMonitor::new(ConnectivityState::Online)),
        Arc::new(clock),
    );

    let state = cache.read();
    assert_eq!(state.data, Some(json!({ "rent": 1200 })));
    assert_eq!(state.last_updated, Some(fetched_at));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_offline_non_forced_refresh_is_inert() {
    let temp_dir = TempDir::new().unwrap();
    let clock = ManualClock::default();
    let connectivity = Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline));
    let calls = Arc::new(AtomicU32::new(0));
    let cache = OfflineCache::new(
        "goals",
        TTL,
        counting_fetcher(calls.clone(), json!(["vacation"])),
        Arc::new(SqliteStore::new(temp_dir.path().join("cache.db")).unwrap()),
        connectivity,
        Arc::new(clock),
    );

    let before = cache.read();
    for _ in 0..3 {
        assert!(matches!(
            cache.refresh(false).await,
            RefreshOutcome::Skipped(SkipReason::Offline)
        ));
    }

    assert_eq!(cache.read(), before);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// Full stack: TallyClient over HTTP with a SQLite cache.

#[derive(Clone, Default)]
struct Backend {
    hits: Arc<AtomicU32>,
    status: Arc<AtomicU16>,
}

async fn accounts(State(backend): State<Backend>) -> (StatusCode, Json<Value>) {
    backend.hits.fetch_add(1, Ordering::SeqCst);
    let status = StatusCode::from_u16(backend.status.load(Ordering::SeqCst)).unwrap();
    if status.is_success() {
        (status, Json(json!([{ "name": "Checking", "balance": 1520.75 }])))
    } else {
        (status, Json(json!({ "error": "session expired" })))
    }
}

async fn full_stack(temp_dir: &TempDir, backend: Backend) -> TallyClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let app = Router::new()
        .route("/api/accounts", get(accounts))
        .with_state(backend);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let session = Arc::new(AuthSession::new(Arc::new(MemoryCredentialStore::with_token(
        "token-1",
    ))));
    let executor = RequestExecutor::new(
        &base_url,
        Arc::new(ReqwestTransport::new().unwrap()),
        session,
    )
    .unwrap()
    .with_retry(RetryConfig::none());

    let config = ClientConfig {
        api_base_url: base_url,
        ..ClientConfig::default()
    };

    TallyClient::new(
        config,
        Arc::new(executor),
        Arc::new(SqliteStore::new(temp_dir.path().join("cache.db")).unwrap()),
        Arc::new(ConnectivityMonitor::new(ConnectivityState::Offline)),
    )
}

#[tokio::test]
async fn test_reconnect_revalidates_missing_data() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Backend::default();
    backend.status.store(200, Ordering::SeqCst);
    let client = full_stack(&temp_dir, backend.clone()).await;

    let cache = client.cache(Resource::Accounts);
    let mut updates = cache.subscribe();
    assert!(cache.read().is_empty());
    assert!(!cache.read().is_online);

    client.connectivity().set_online(true);

    let state = updates
        .wait_for(|state| state.data.is_some())
        .await
        .unwrap()
        .clone();
    assert_eq!(state.data.unwrap()[0]["name"], "Checking");
    assert!(state.is_online);
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.cached_keys().unwrap(), vec!["accounts"]);
}

#[tokio::test]
async fn test_unauthorized_keeps_cached_data_and_signs_out() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Backend::default();
    backend.status.store(200, Ordering::SeqCst);
    let client = full_stack(&temp_dir, backend.clone()).await;

    assert!(client.refresh(Resource::Accounts, true).await.is_applied());

    backend.status.store(401, Ordering::SeqCst);
    let outcome = client.refresh(Resource::Accounts, true).await;

    assert!(matches!(outcome, RefreshOutcome::Failed(ref e) if e.is_unauthorized()));
    assert_eq!(backend.hits.load(Ordering::SeqCst), 2);
    assert!(!client.auth().is_signed_in());

    let state = client.read(Resource::Accounts);
    assert!(state.is_stale_with_error());
    assert_eq!(state.error.as_deref(), Some("session expired"));
    assert_eq!(state.data.unwrap()[0]["balance"], 1520.75);
}
