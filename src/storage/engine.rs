use crate::core::{GraphError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Extra facts a store passes along with a mutation.
pub type MutationMetadata = BTreeMap<String, serde_json::Value>;

/// Callback invoked with (key, serialized value, metadata).
pub type MutationCallback =
    Arc<dyn Fn(u64, &[u8], &MutationMetadata) -> Result<()> + Send + Sync>;

/// Pair of callbacks a store invokes synchronously on its commit path.
#[derive(Clone)]
pub struct MutationObserver {
    pub on_added: MutationCallback,
    pub on_removed: MutationCallback,
}

impl MutationObserver {
    pub fn new<A, R>(on_added: A, on_removed: R) -> Self
    where
        A: Fn(u64, &[u8], &MutationMetadata) -> Result<()> + Send + Sync + 'static,
        R: Fn(u64, &[u8], &MutationMetadata) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            on_added: Arc::new(on_added),
            on_removed: Arc::new(on_removed),
        }
    }
}

impl fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MutationObserver")
    }
}

/// Durable store transaction boundary - allows pluggable backing stores
pub trait StoreEngine: Send + Sync {
    /// Open a store transaction
    fn begin(&self) -> Result<()>;

    /// Make everything written since `begin` durable
    fn commit(&self) -> Result<()>;

    /// Whether `abort` can roll back writes
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Roll back everything written since `begin`
    fn abort(&self) -> Result<()> {
        Err(GraphError::UnsupportedOperation(
            "backing store does not support rollback".to_string(),
        ))
    }
}
