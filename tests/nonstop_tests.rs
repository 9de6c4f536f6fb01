/// Nonstop cache tests
///
/// Disconnects the server tier and checks each timeout behavior, including
/// that the answer arrives once the configured timeout has elapsed and not
/// meaningfully later.
/// Run with: cargo test --test nonstop_tests
use async_trait::async_trait;
use graphmesh::nonstop::{ClusteredStore, InMemoryClusteredStore};
use graphmesh::{GraphError, NonStopCache, NonStopConfig, NonStopTimeoutBehavior, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

const TIMEOUT: Duration = Duration::from_millis(1000);
const SLACK: Duration = Duration::from_millis(50);

fn setup(
    behavior: NonStopTimeoutBehavior,
) -> (
    Arc<InMemoryClusteredStore<String, String>>,
    NonStopCache<String, String>,
) {
    let store = Arc::new(InMemoryClusteredStore::new());
    let remote: Arc<dyn ClusteredStore<String, String>> = store.clone();
    let config = NonStopConfig::new().timeout(TIMEOUT).behavior(behavior);
    let cache = NonStopCache::new("orders", remote, config).unwrap();
    (store, cache)
}

fn assert_within_bound(started: Instant) {
    let elapsed = started.elapsed();
    assert!(elapsed >= TIMEOUT, "answered early after {:?}", elapsed);
    assert!(elapsed <= TIMEOUT + SLACK, "answered late after {:?}", elapsed);
}

fn key(name: &str) -> String {
    name.to_string()
}

#[tokio::test(start_paused = true)]
async fn test_noop_read_returns_absent_after_timeout() {
    let (store, cache) = setup(NonStopTimeoutBehavior::NoOp);
    store.disconnect();

    let started = Instant::now();
    let value = assert_ok!(cache.get(&key("K")).await);
    assert_within_bound(started);
    assert_eq!(value, None);
}

#[tokio::test(start_paused = true)]
async fn test_noop_mutation_is_dropped() {
    let (store, cache) = setup(NonStopTimeoutBehavior::NoOp);
    store.disconnect();

    let started = Instant::now();
    assert_ok!(cache.put(key("K"), "V".into()).await);
    assert_within_bound(started);
    assert_eq!(cache.local_value(&key("K")).unwrap(), None);

    store.reconnect();
    assert_eq!(store.server_value(&key("K")).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_exception_on_timeout_for_reads_and_mutations() {
    let (store, cache) = setup(NonStopTimeoutBehavior::ExceptionOnTimeout);
    cache.put(key("K"), "V".into()).await.unwrap();
    store.disconnect();

    let started = Instant::now();
    let err = assert_err!(cache.get(&key("K")).await);
    assert_within_bound(started);
    assert!(matches!(
        err,
        GraphError::NonStopTimeout { timeout_ms: 1000, .. }
    ));

    let started = Instant::now();
    let err = assert_err!(cache.put(key("K"), "W".into()).await);
    assert_within_bound(started);
    assert!(err.is_timeout());

    let started = Instant::now();
    assert!(assert_err!(cache.remove(&key("K")).await).is_timeout());
    assert_within_bound(started);
}

#[tokio::test(start_paused = true)]
async fn test_local_reads_serves_cached_value_and_applies_writes_locally() {
    let (store, cache) = setup(NonStopTimeoutBehavior::LocalReads);
    cache.put(key("K"), "V".into()).await.unwrap();
    store.disconnect();

    let started = Instant::now();
    let value = assert_ok!(cache.get(&key("K")).await);
    assert_within_bound(started);
    assert_eq!(value.as_deref(), Some("V"));

    let started = Instant::now();
    assert_ok!(cache.put(key("K"), "W".into()).await);
    assert_within_bound(started);
    assert_eq!(cache.local_value(&key("K")).unwrap().as_deref(), Some("W"));

    let missing = assert_err!(cache.get(&key("missing")).await);
    assert!(missing.is_timeout());

    store.reconnect();
    assert_eq!(store.server_value(&key("K")).await.as_deref(), Some("V"));
    assert_eq!(cache.get(&key("K")).await.unwrap().as_deref(), Some("V"));
}

#[tokio::test(start_paused = true)]
async fn test_mutate_exception_mode_reads_locally_but_rejects_writes() {
    let (store, cache) = setup(NonStopTimeoutBehavior::ExceptionOnMutateAndLocalReads);
    cache.put(key("K"), "V".into()).await.unwrap();
    store.disconnect();

    assert_eq!(
        assert_ok!(cache.get(&key("K")).await).as_deref(),
        Some("V")
    );
    let started = Instant::now();
    assert!(assert_err!(cache.put(key("K"), "W".into()).await).is_timeout());
    assert_within_bound(started);
    assert_eq!(cache.local_value(&key("K")).unwrap().as_deref(), Some("V"));
}

#[tokio::test(start_paused = true)]
async fn test_operation_completes_once_cluster_returns_within_timeout() {
    let (store, cache) = setup(NonStopTimeoutBehavior::ExceptionOnTimeout);
    let cache = Arc::new(cache);
    store.disconnect();

    let pending = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.put("K".to_string(), "V".to_string()).await })
    };
    tokio::time::sleep(Duration::from_millis(400)).await;
    store.reconnect();

    assert_ok!(pending.await.unwrap());
    assert_eq!(store.server_value(&key("K")).await.as_deref(), Some("V"));
}

/// Server tier that refuses the first `refusals` calls outright instead of
/// hanging, then serves `value`.
struct RefusingStore {
    refusals: usize,
    calls: AtomicUsize,
    value: String,
}

impl RefusingStore {
    fn new(refusals: usize) -> Self {
        Self {
            refusals,
            calls: AtomicUsize::new(0),
            value: "served".to_string(),
        }
    }

    fn answer(&self) -> Result<Option<String>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.refusals {
            return Err(GraphError::Disconnected("server down".to_string()));
        }
        Ok(Some(self.value.clone()))
    }
}

#[async_trait]
impl ClusteredStore<String, String> for RefusingStore {
    async fn get(&self, _key: &String) -> Result<Option<String>> {
        self.answer()
    }

    async fn put(&self, _key: String, _value: String) -> Result<Option<String>> {
        self.answer()
    }

    async fn remove(&self, _key: &String) -> Result<Option<String>> {
        self.answer()
    }
}

fn refusing_cache(
    refusals: usize,
    behavior: NonStopTimeoutBehavior,
) -> (Arc<RefusingStore>, NonStopCache<String, String>) {
    let store = Arc::new(RefusingStore::new(refusals));
    let remote: Arc<dyn ClusteredStore<String, String>> = store.clone();
    let config = NonStopConfig::new().timeout(TIMEOUT).behavior(behavior);
    (store, NonStopCache::new("orders", remote, config).unwrap())
}

#[tokio::test(start_paused = true)]
async fn test_noop_absorbs_fail_fast_disconnects() {
    let (store, cache) = refusing_cache(usize::MAX, NonStopTimeoutBehavior::NoOp);

    let started = Instant::now();
    assert_eq!(assert_ok!(cache.get(&key("K")).await), None);
    assert_within_bound(started);
    assert!(store.calls.load(Ordering::SeqCst) > 1);

    let started = Instant::now();
    assert_eq!(assert_ok!(cache.put(key("K"), "V".into()).await), None);
    assert_within_bound(started);
    assert_eq!(cache.local_value(&key("K")).unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_local_reads_absorbs_fail_fast_disconnects() {
    let (_store, cache) = refusing_cache(usize::MAX, NonStopTimeoutBehavior::LocalReads);

    let started = Instant::now();
    assert_ok!(cache.put(key("K"), "V".into()).await);
    assert_within_bound(started);
    assert_eq!(cache.local_value(&key("K")).unwrap().as_deref(), Some("V"));

    let started = Instant::now();
    assert_eq!(assert_ok!(cache.get(&key("K")).await).as_deref(), Some("V"));
    assert_within_bound(started);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_disconnects_surface_as_timeouts() {
    let (_store, cache) = refusing_cache(usize::MAX, NonStopTimeoutBehavior::ExceptionOnTimeout);

    let started = Instant::now();
    let err = assert_err!(cache.get(&key("K")).await);
    assert_within_bound(started);
    assert!(err.is_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_refused_call_succeeds_once_server_accepts() {
    let (store, cache) = refusing_cache(3, NonStopTimeoutBehavior::ExceptionOnTimeout);

    let started = Instant::now();
    assert_eq!(
        assert_ok!(cache.get(&key("K")).await).as_deref(),
        Some("served")
    );
    assert!(started.elapsed() < TIMEOUT);
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
}
