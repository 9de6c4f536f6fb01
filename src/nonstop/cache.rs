// ============================================================================
// Nonstop Cache
// ============================================================================
//
// Client-side cache facade that keeps answering while the server tier is
// unreachable. Every operation gets a deadline when it is submitted; if the
// clustered call has not finished by then, it is cancelled and the configured
// NonStopTimeoutBehavior decides the result:
//
//   behavior                          read                  mutation
//   ExceptionOnTimeout                timeout error         timeout error
//   ExceptionOnMutateAndLocalReads    local value or error  timeout error
//   LocalReads                        local value or error  applied locally
//   NoOp                              None                  dropped
//
// A server tier that fails fast with Disconnected counts as not reachable
// yet: the call is retried until the deadline, then handled like any other
// timeout.
//
// The local LRU is only touched after the clustered call has settled, and its
// lock is never held across an await.
//
// ============================================================================

use super::config::{NonStopConfig, NonStopTimeoutBehavior};
use super::remote::ClusteredStore;
use crate::core::{GraphError, Result};
use log::{debug, warn};
use lru::LruCache;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout_at};

/// Pause between attempts while the server tier refuses connections.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(50);

enum Mutation<V> {
    Put(V),
    Remove,
}

/// A cache whose operations finish within the configured timeout, whether
/// or not the server tier answers.
///
/// # Examples
///
/// ```
/// use graphmesh::{NonStopCache, NonStopConfig, NonStopTimeoutBehavior};
/// use graphmesh::nonstop::{ClusteredStore, InMemoryClusteredStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let store = Arc::new(InMemoryClusteredStore::<String, String>::new());
/// let remote: Arc<dyn ClusteredStore<String, String>> = store.clone();
/// let cache = NonStopCache::new(
///     "sessions",
///     remote,
///     NonStopConfig::new()
///         .timeout(Duration::from_millis(20))
///         .behavior(NonStopTimeoutBehavior::NoOp),
/// )?;
///
/// cache.put("user".to_string(), "alice".to_string()).await?;
/// store.disconnect();
/// assert_eq!(cache.get(&"other".to_string()).await?, None);
/// # Ok::<(), graphmesh::GraphError>(())
/// # }).unwrap();
/// ```
pub struct NonStopCache<K, V> {
    name: String,
    remote: Arc<dyn ClusteredStore<K, V>>,
    local: Mutex<LruCache<K, V>>,
    config: NonStopConfig,
}

impl<K, V> NonStopCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        remote: Arc<dyn ClusteredStore<K, V>>,
        config: NonStopConfig,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.local_cache_capacity).ok_or_else(|| {
            GraphError::ConfigError("nonstop local_cache_capacity must be > 0".to_string())
        })?;
        Ok(Self {
            name: name.into(),
            remote,
            local: Mutex::new(LruCache::new(capacity)),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &NonStopConfig {
        &self.config
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let deadline = self.deadline();
        let settled = self.within(deadline, || self.remote.get(key)).await;
        match settled {
            Some(Ok(value)) => {
                let mut local = self.local.lock()?;
                match &value {
                    Some(value) => {
                        local.put(key.clone(), value.clone());
                    }
                    None => {
                        local.pop(key);
                    }
                }
                Ok(value)
            }
            Some(Err(err)) => Err(err),
            None => self.read_timed_out(key),
        }
    }

    /// Returns the previous value as reported by the server tier, or by the
    /// local cache when the write was applied locally.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let deadline = self.deadline();
        let settled = self
            .within(deadline, || self.remote.put(key.clone(), value.clone()))
            .await;
        match settled {
            Some(Ok(previous)) => {
                self.local.lock()?.put(key, value);
                Ok(previous)
            }
            Some(Err(err)) => Err(err),
            None => self.mutation_timed_out("put", key, Mutation::Put(value)),
        }
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let deadline = self.deadline();
        let settled = self.within(deadline, || self.remote.remove(key)).await;
        match settled {
            Some(Ok(previous)) => {
                self.local.lock()?.pop(key);
                Ok(previous)
            }
            Some(Err(err)) => Err(err),
            None => self.mutation_timed_out("remove", key.clone(), Mutation::Remove),
        }
    }

    /// The locally cached value for `key`, without contacting the cluster.
    pub fn local_value(&self, key: &K) -> Result<Option<V>> {
        Ok(self.local.lock()?.peek(key).cloned())
    }

    pub fn local_len(&self) -> Result<usize> {
        Ok(self.local.lock()?.len())
    }

    /// `None` when the timeout reaches past what the clock can represent.
    fn deadline(&self) -> Option<Instant> {
        Instant::now().checked_add(self.config.timeout_duration())
    }

    /// Attempts `call` until it settles or `deadline` passes; `None` means
    /// timed out. `Disconnected` answers are retried, never returned.
    async fn within<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut call: F,
    ) -> Option<Result<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = async {
            loop {
                match call().await {
                    Err(GraphError::Disconnected(reason)) => {
                        debug!("{}: cluster unreachable ({}), retrying", self.name, reason);
                        sleep(RECONNECT_BACKOFF).await;
                    }
                    settled => return settled,
                }
            }
        };
        match deadline {
            Some(deadline) if self.config.enabled => timeout_at(deadline, attempts).await.ok(),
            _ => Some(attempts.await),
        }
    }

    fn timeout_error(&self, operation: &str) -> GraphError {
        GraphError::NonStopTimeout {
            operation: format!("{}.{}", self.name, operation),
            timeout_ms: self.config.timeout_ms,
        }
    }

    fn read_timed_out(&self, key: &K) -> Result<Option<V>> {
        let behavior = self.config.behavior;
        match behavior {
            NonStopTimeoutBehavior::ExceptionOnTimeout => Err(self.timeout_error("get")),
            NonStopTimeoutBehavior::ExceptionOnMutateAndLocalReads
            | NonStopTimeoutBehavior::LocalReads => {
                let cached = self.local.lock()?.get(key).cloned();
                match cached {
                    Some(value) => {
                        warn!(
                            "{}: cluster unreachable after {}ms, serving local value ({})",
                            self.name, self.config.timeout_ms, behavior
                        );
                        Ok(Some(value))
                    }
                    None => Err(self.timeout_error("get")),
                }
            }
            NonStopTimeoutBehavior::NoOp => {
                debug!("{}: get timed out, returning nothing", self.name);
                Ok(None)
            }
        }
    }

    fn mutation_timed_out(
        &self,
        operation: &str,
        key: K,
        mutation: Mutation<V>,
    ) -> Result<Option<V>> {
        match self.config.behavior {
            NonStopTimeoutBehavior::ExceptionOnTimeout
            | NonStopTimeoutBehavior::ExceptionOnMutateAndLocalReads => {
                Err(self.timeout_error(operation))
            }
            NonStopTimeoutBehavior::LocalReads => {
                let mut local = self.local.lock()?;
                let previous = match mutation {
                    Mutation::Put(value) => local.put(key, value),
                    Mutation::Remove => local.pop(&key),
                };
                warn!(
                    "{}: cluster unreachable after {}ms, {} applied locally only",
                    self.name, self.config.timeout_ms, operation
                );
                Ok(previous)
            }
            NonStopTimeoutBehavior::NoOp => {
                debug!("{}: {} timed out and was dropped", self.name, operation);
                Ok(None)
            }
        }
    }
}
