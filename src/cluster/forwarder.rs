use super::config::Node;
use crate::core::{GlobalTransactionId, GraphError, Result};
use crate::transaction::ShippedTransaction;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Transport that delivers a committed transaction to one passive.
#[async_trait]
pub trait PassiveForwarder: Send + Sync {
    /// Returns once `target` has applied `txn`.
    async fn ship(&self, target: &Node, txn: ShippedTransaction) -> Result<()>;
}

#[derive(Default)]
struct InMemoryPassive {
    received: Vec<ShippedTransaction>,
    partitioned: bool,
}

/// A `PassiveForwarder` that hands transactions to in-process passives.
///
/// Passives must be registered before they can receive anything; a
/// partitioned passive behaves like an unreachable host.
#[derive(Clone, Default)]
pub struct InMemoryForwarder {
    passives: Arc<Mutex<HashMap<String, InMemoryPassive>>>,
}

impl InMemoryForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_passive(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(GraphError::ConfigError(
                "passive name must not be empty".to_string(),
            ));
        }
        self.passives.lock().await.entry(name).or_default();
        Ok(())
    }

    /// Cuts (or restores) the link to a registered passive.
    pub async fn partition(&self, name: &str, partitioned: bool) -> Result<()> {
        let mut passives = self.passives.lock().await;
        let passive = passives.get_mut(name).ok_or_else(|| not_registered(name))?;
        passive.partitioned = partitioned;
        Ok(())
    }

    /// Everything `name` has received, in arrival order.
    pub async fn received(&self, name: &str) -> Result<Vec<ShippedTransaction>> {
        let passives = self.passives.lock().await;
        let passive = passives.get(name).ok_or_else(|| not_registered(name))?;
        Ok(passive.received.clone())
    }

    /// Highest global id `name` has applied.
    pub async fn last_applied(&self, name: &str) -> Result<Option<GlobalTransactionId>> {
        Ok(self
            .received(name)
            .await?
            .iter()
            .filter_map(ShippedTransaction::global_transaction_id)
            .max())
    }
}

fn not_registered(name: &str) -> GraphError {
    GraphError::Disconnected(format!("passive '{}' is not registered", name))
}

#[async_trait]
impl PassiveForwarder for InMemoryForwarder {
    async fn ship(&self, target: &Node, txn: ShippedTransaction) -> Result<()> {
        let mut passives = self.passives.lock().await;
        let passive = passives
            .get_mut(&target.name)
            .ok_or_else(|| not_registered(&target.name))?;
        if passive.partitioned {
            return Err(GraphError::Disconnected(format!(
                "passive '{}' is partitioned",
                target.name
            )));
        }
        passive.received.push(txn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeId, ObjectId, TransactionId};
    use crate::transaction::{ObjectChange, TransactionRecord};

    fn shipped(gid: u64) -> ShippedTransaction {
        let record = TransactionRecord::builder(NodeId::new("c"), TransactionId(gid))
            .change(ObjectChange::created(ObjectId(gid)))
            .build()
            .unwrap();
        record.assign_global_id(GlobalTransactionId(gid)).unwrap();
        ShippedTransaction::Full(Arc::new(record))
    }

    #[tokio::test]
    async fn test_ship_to_registered_passive() {
        let forwarder = InMemoryForwarder::new();
        forwarder.register_passive("p1").await.unwrap();
        let target = Node::new("p1", "h", 1, 2);

        forwarder.ship(&target, shipped(1)).await.unwrap();
        forwarder.ship(&target, shipped(2)).await.unwrap();

        assert_eq!(forwarder.received("p1").await.unwrap().len(), 2);
        assert_eq!(
            forwarder.last_applied("p1").await.unwrap(),
            Some(GlobalTransactionId(2))
        );
    }

    #[tokio::test]
    async fn test_partitioned_and_unknown_passives_fail() {
        let forwarder = InMemoryForwarder::new();
        forwarder.register_passive("p1").await.unwrap();
        forwarder.partition("p1", true).await.unwrap();

        let err = forwarder
            .ship(&Node::new("p1", "h", 1, 2), shipped(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Disconnected(_)));

        let err = forwarder
            .ship(&Node::new("p9", "h", 1, 2), shipped(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::Disconnected(_)));
    }
}
