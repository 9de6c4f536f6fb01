use super::engine::{MutationMetadata, MutationObserver, StoreEngine};
use crate::core::{GraphError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

/// Named maps and the observers wired to them at start.
#[derive(Debug, Default, Clone)]
pub struct StoreConfig {
    maps: BTreeMap<String, Vec<MutationObserver>>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, name: impl Into<String>) -> Self {
        self.maps.entry(name.into()).or_default();
        self
    }

    pub fn observer(mut self, map: impl Into<String>, observer: MutationObserver) -> Self {
        self.maps.entry(map.into()).or_default().push(observer);
        self
    }

    pub fn map_names(&self) -> impl Iterator<Item = &str> {
        self.maps.keys().map(String::as_str)
    }
}

/// A raw `u64 -> bytes` map that notifies observers on every mutation.
#[derive(Debug)]
pub struct StoreMap {
    name: String,
    entries: RwLock<BTreeMap<u64, Vec<u8>>>,
    observers: Vec<MutationObserver>,
}

impl StoreMap {
    fn new(name: impl Into<String>, observers: Vec<MutationObserver>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(BTreeMap::new()),
            observers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store `value` under `key`.
    ///
    /// Replacing a value is reported as an add only. If an observer rejects
    /// the value nothing is written.
    pub fn put(&self, key: u64, value: Vec<u8>) -> Result<()> {
        let metadata = MutationMetadata::new();
        let mut entries = self.entries.write()?;
        for observer in &self.observers {
            (observer.on_added)(key, &value, &metadata)?;
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read()?.get(&key).cloned())
    }

    /// Returns true if the key was present
    pub fn remove(&self, key: u64) -> Result<bool> {
        let metadata = MutationMetadata::new();
        let mut entries = self.entries.write()?;
        match entries.remove(&key) {
            Some(previous) => {
                for observer in &self.observers {
                    (observer.on_removed)(key, &previous, &metadata)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn contains_key(&self, key: u64) -> Result<bool> {
        Ok(self.entries.read()?.contains_key(&key))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn keys(&self) -> Result<Vec<u64>> {
        Ok(self.entries.read()?.keys().copied().collect())
    }

    pub fn clear(&self) -> Result<()> {
        let metadata = MutationMetadata::new();
        let mut entries = self.entries.write()?;
        let drained = std::mem::take(&mut *entries);
        for (key, previous) in &drained {
            for observer in &self.observers {
                (observer.on_removed)(*key, previous, &metadata)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Configured,
    Started,
    Shutdown,
}

/// On-heap backing store holding named maps.
///
/// Lifecycle: `Configured -> Started -> Shutdown`. Writes apply immediately,
/// so store transactions only delimit durability points and cannot roll back.
#[derive(Debug)]
pub struct ObjectStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
    maps: RwLock<HashMap<String, Arc<StoreMap>>>,
    open_transactions: AtomicUsize,
    commits: AtomicU64,
}

impl ObjectStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: RwLock::new(StoreState::Configured),
            maps: RwLock::new(HashMap::new()),
            open_transactions: AtomicUsize::new(0),
            commits: AtomicU64::new(0),
        }
    }

    /// Create the configured maps and wire their observers.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write()?;
        if *state != StoreState::Configured {
            return Err(GraphError::IllegalState(format!(
                "object store cannot start from {:?}",
                *state
            )));
        }

        let mut maps = self.maps.write()?;
        for (name, observers) in &self.config.maps {
            maps.insert(
                name.clone(),
                Arc::new(StoreMap::new(name.clone(), observers.clone())),
            );
        }
        *state = StoreState::Started;
        event!(Level::INFO, maps = maps.len(), "object store started");
        Ok(())
    }

    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state.write()?;
        *state = StoreState::Shutdown;
        self.maps.write()?.clear();
        Ok(())
    }

    pub fn is_started(&self) -> Result<bool> {
        Ok(*self.state.read()? == StoreState::Started)
    }

    fn ensure_started(&self) -> Result<()> {
        let state = *self.state.read()?;
        if state != StoreState::Started {
            return Err(GraphError::IllegalState(format!(
                "object store is {:?}, not started",
                state
            )));
        }
        Ok(())
    }

    /// Add a map after start.
    pub fn attach_map(
        &self,
        name: impl Into<String>,
        observers: Vec<MutationObserver>,
    ) -> Result<Arc<StoreMap>> {
        self.ensure_started()?;
        let name = name.into();
        let mut maps = self.maps.write()?;
        if maps.contains_key(&name) {
            return Err(GraphError::ExecutionError(format!(
                "map '{}' is already attached",
                name
            )));
        }
        let map = Arc::new(StoreMap::new(name.clone(), observers));
        maps.insert(name, Arc::clone(&map));
        Ok(map)
    }

    /// `None` when no map of that name exists.
    pub fn get_map(&self, name: &str) -> Result<Option<Arc<StoreMap>>> {
        self.ensure_started()?;
        Ok(self.maps.read()?.get(name).cloned())
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::SeqCst)
    }
}

impl StoreEngine for ObjectStore {
    fn begin(&self) -> Result<()> {
        self.ensure_started()?;
        self.open_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.ensure_started()?;
        self.open_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| open.checked_sub(1))
            .map_err(|_| {
                GraphError::IllegalState("commit without an open store transaction".to_string())
            })?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_cant_access_map_if_not_started() {
        let store = ObjectStore::new(StoreConfig::new().map("objects"));
        assert!(matches!(store.get_map("objects"), Err(GraphError::IllegalState(_))));
        assert!(matches!(
            store.attach_map("other", Vec::new()),
            Err(GraphError::IllegalState(_))
        ));
    }

    #[test]
    fn test_returns_none_when_not_configured() {
        let store = ObjectStore::new(StoreConfig::new());
        store.start().unwrap();
        assert!(store.get_map("whatever").unwrap().is_none());
    }

    #[test]
    fn test_throws_when_stopped() {
        let store = ObjectStore::new(StoreConfig::new().map("objects"));
        store.start().unwrap();
        assert!(store.get_map("objects").unwrap().is_some());
        store.shutdown().unwrap();
        assert!(matches!(store.get_map("objects"), Err(GraphError::IllegalState(_))));
        assert!(store.start().is_err());
    }

    #[test]
    fn test_observers_wired_from_config() {
        let invoked = Arc::new(AtomicBool::new(false));
        let added = Arc::clone(&invoked);
        let removed = Arc::clone(&invoked);
        let observer = MutationObserver::new(
            move |_, _, _| {
                added.store(true, Ordering::SeqCst);
                Ok(())
            },
            move |_, _, _| {
                removed.store(true, Ordering::SeqCst);
                Ok(())
            },
        );
        let store = ObjectStore::new(StoreConfig::new().observer("objects", observer));
        store.start().unwrap();

        let map = store.get_map("objects").unwrap().unwrap();
        assert!(!invoked.load(Ordering::SeqCst));
        map.put(1, vec![1]).unwrap();
        assert!(invoked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_rejected_put_is_not_written() {
        let observer = MutationObserver::new(
            |_, _, _| Err(GraphError::AssertionFailed("rejected".into())),
            |_, _, _| Ok(()),
        );
        let store = ObjectStore::new(StoreConfig::new().observer("objects", observer));
        store.start().unwrap();
        let map = store.get_map("objects").unwrap().unwrap();

        assert!(map.put(1, vec![0]).is_err());
        assert!(!map.contains_key(1).unwrap());
    }

    #[test]
    fn test_commit_requires_begin() {
        let store = ObjectStore::new(StoreConfig::new());
        store.start().unwrap();
        assert!(matches!(store.commit(), Err(GraphError::IllegalState(_))));

        store.begin().unwrap();
        assert_eq!(store.open_transactions(), 1);
        store.commit().unwrap();
        assert_eq!(store.commit_count(), 1);
        assert!(matches!(store.abort(), Err(GraphError::UnsupportedOperation(_))));
    }
}
