use crate::core::{GraphError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use tokio::sync::{Mutex, watch};

/// Key/value operations served by the server tier.
#[async_trait]
pub trait ClusteredStore<K, V>: Send + Sync {
    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// Returns the previous value.
    async fn put(&self, key: K, value: V) -> Result<Option<V>>;

    /// Returns the removed value.
    async fn remove(&self, key: &K) -> Result<Option<V>>;
}

/// In-process stand-in for the server tier.
///
/// While disconnected, every call waits for the connection to come back,
/// the way a reconnecting client does; it is up to the caller to bound that
/// wait.
#[derive(Debug)]
pub struct InMemoryClusteredStore<K, V> {
    entries: Mutex<HashMap<K, V>>,
    connected: watch::Sender<bool>,
}

impl<K, V> InMemoryClusteredStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            entries: Mutex::new(HashMap::new()),
            connected,
        }
    }

    pub fn disconnect(&self) {
        self.connected.send_replace(false);
    }

    pub fn reconnect(&self) {
        self.connected.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Server-side view of `key`, ignoring connectivity.
    pub async fn server_value(&self, key: &K) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    async fn wait_connected(&self) -> Result<()> {
        let mut connected = self.connected.subscribe();
        connected
            .wait_for(|up| *up)
            .await
            .map(|_| ())
            .map_err(|_| GraphError::Disconnected("cluster connection closed".to_string()))
    }
}

impl<K, V> Default for InMemoryClusteredStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> ClusteredStore<K, V> for InMemoryClusteredStore<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>> {
        self.wait_connected().await?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.wait_connected().await?;
        Ok(self.entries.lock().await.insert(key, value))
    }

    async fn remove(&self, key: &K) -> Result<Option<V>> {
        self.wait_connected().await?;
        Ok(self.entries.lock().await.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connected_store_behaves_like_a_map() {
        let store = InMemoryClusteredStore::<String, u32>::new();
        assert_eq!(store.put("a".into(), 1).await.unwrap(), None);
        assert_eq!(store.put("a".into(), 2).await.unwrap(), Some(1));
        assert_eq!(store.get(&"a".to_string()).await.unwrap(), Some(2));
        assert_eq!(store.remove(&"a".to_string()).await.unwrap(), Some(2));
        assert_eq!(store.get(&"a".to_string()).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_calls_wait_for_reconnect() {
        let store = std::sync::Arc::new(InMemoryClusteredStore::<String, u32>::new());
        store.disconnect();
        assert!(!store.is_connected());

        let key = "a".to_string();
        let pending = tokio::time::timeout(Duration::from_millis(50), store.get(&key));
        assert!(pending.await.is_err());

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.put("a".to_string(), 7).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.server_value(&key).await, None);

        store.reconnect();
        assert_eq!(waiter.await.unwrap().unwrap(), None);
        assert_eq!(store.server_value(&key).await, Some(7));
    }
}
