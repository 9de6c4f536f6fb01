// ============================================================================
// Commit Pipeline
// ============================================================================
//
// Applies one client transaction to the backing store and produces the
// immutable record that is shipped downstream:
//
//   build record -> begin store txn -> write/delete objects (tracker observes)
//                -> commit store txn -> assign global id
//
// Commits are serialised so global ids follow store commit order.
//
// ============================================================================

use super::record::{TransactionRecord, TransactionRecordBuilder};
use super::sequencer::GlobalTransactionIdSequencer;
use crate::core::{GraphError, ObjectId, Result};
use crate::storage::{
    ManagedObject, ObjectIdSetTracker, ObjectMap, ObjectStore, PersistenceTransactionProvider,
    StoreConfig, header_classifier,
};
use std::sync::{Arc, Mutex};
use tracing::{Level, event, info_span};

pub const OBJECT_MAP_NAME: &str = "objects";

/// Applies client transactions to the store and sequences them.
///
/// # Examples
///
/// ```
/// use graphmesh::{
///     CommitPipeline, GlobalTransactionIdSequencer, ManagedObject, NodeId, ObjectChange,
///     ObjectId, ObjectType, TransactionId, TransactionRecord,
/// };
/// use std::sync::Arc;
///
/// # fn main() -> graphmesh::Result<()> {
/// let pipeline = CommitPipeline::open(Arc::new(GlobalTransactionIdSequencer::new()))?;
///
/// let record = pipeline.commit(
///     TransactionRecord::builder(NodeId::new("client-1"), TransactionId(1))
///         .change(ObjectChange::created(ObjectId(100))),
///     &[ManagedObject::new(ObjectId(100), ObjectType::ServerMap)],
///     &[],
/// )?;
///
/// assert!(record.global_transaction_id().is_some());
/// assert!(pipeline.tracker().evictable_snapshot()?.contains(&ObjectId(100)));
/// # Ok(())
/// # }
/// ```
pub struct CommitPipeline {
    store: Arc<ObjectStore>,
    transactions: PersistenceTransactionProvider,
    objects: ObjectMap,
    tracker: Arc<ObjectIdSetTracker>,
    sequencer: Arc<GlobalTransactionIdSequencer>,
    commit_lock: Mutex<()>,
}

impl CommitPipeline {
    /// Start a fresh on-heap store whose object map feeds a new tracker.
    pub fn open(sequencer: Arc<GlobalTransactionIdSequencer>) -> Result<Self> {
        let tracker = Arc::new(ObjectIdSetTracker::new(header_classifier));
        let config = StoreConfig::new().observer(OBJECT_MAP_NAME, tracker.observer());
        let store = Arc::new(ObjectStore::new(config));
        store.start()?;
        Self::new(store, tracker, sequencer)
    }

    /// Use an already started store. The tracker must be observing the
    /// store's object map.
    pub fn new(
        store: Arc<ObjectStore>,
        tracker: Arc<ObjectIdSetTracker>,
        sequencer: Arc<GlobalTransactionIdSequencer>,
    ) -> Result<Self> {
        let map = store.get_map(OBJECT_MAP_NAME)?.ok_or_else(|| {
            GraphError::ConfigError(format!(
                "object store has no '{}' map configured",
                OBJECT_MAP_NAME
            ))
        })?;
        Ok(Self {
            transactions: PersistenceTransactionProvider::new(store.clone()),
            store,
            objects: ObjectMap::new(map),
            tracker,
            sequencer,
            commit_lock: Mutex::new(()),
        })
    }

    /// Commit `writes` and `deletes` and return the sequenced record.
    ///
    /// # Errors
    /// `AssertionFailed` when a written object is not referenced by the
    /// record; any store or classification error aborts the commit before
    /// a global id is assigned.
    pub fn commit(
        &self,
        builder: TransactionRecordBuilder,
        writes: &[ManagedObject],
        deletes: &[ObjectId],
    ) -> Result<Arc<TransactionRecord>> {
        let record = builder.build()?;
        let span = info_span!(
            "commit.apply",
            txn = %record.server_transaction_id(),
            writes = writes.len(),
            deletes = deletes.len()
        );
        let _enter = span.enter();

        if let Some(stray) = writes
            .iter()
            .find(|object| !record.referenced_object_ids().contains(&object.id))
        {
            return Err(GraphError::AssertionFailed(format!(
                "{} writes {} without referencing it",
                record.server_transaction_id(),
                stray.id
            )));
        }

        let _guard = self.commit_lock.lock()?;
        let mut txn = self.transactions.new_transaction()?;
        for object in writes {
            if let Err(err) = self.objects.put(object) {
                event!(Level::ERROR, error = %err, object = %object.id, "object write failed");
                return Err(err);
            }
        }
        for id in deletes {
            self.objects.remove(*id)?;
        }
        txn.commit()?;

        let gid = self.sequencer.next_id();
        record.assign_global_id(gid)?;
        event!(Level::DEBUG, gid = %gid, "transaction committed");
        Ok(Arc::new(record))
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    pub fn objects(&self) -> &ObjectMap {
        &self.objects
    }

    pub fn tracker(&self) -> &Arc<ObjectIdSetTracker> {
        &self.tracker
    }

    pub fn sequencer(&self) -> &Arc<GlobalTransactionIdSequencer> {
        &self.sequencer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{GlobalTransactionId, NodeId, TransactionId};
    use crate::storage::ObjectType;
    use crate::transaction::change::ObjectChange;

    fn pipeline() -> CommitPipeline {
        CommitPipeline::open(Arc::new(GlobalTransactionIdSequencer::new())).unwrap()
    }

    #[test]
    fn test_commit_assigns_increasing_global_ids() {
        let pipeline = pipeline();
        let first = pipeline
            .commit(
                TransactionRecord::builder(NodeId::new("c1"), TransactionId(1))
                    .change(ObjectChange::created(ObjectId(1))),
                &[ManagedObject::new(ObjectId(1), ObjectType::Physical)],
                &[],
            )
            .unwrap();
        let second = pipeline
            .commit(
                TransactionRecord::builder(NodeId::new("c1"), TransactionId(2))
                    .change(ObjectChange::created(ObjectId(2))),
                &[ManagedObject::new(ObjectId(2), ObjectType::ServerMap)],
                &[],
            )
            .unwrap();

        assert_eq!(first.global_transaction_id(), Some(GlobalTransactionId(1)));
        assert_eq!(second.global_transaction_id(), Some(GlobalTransactionId(2)));
        assert_eq!(pipeline.store().commit_count(), 2);

        let snapshot = pipeline.tracker().snapshot().unwrap();
        assert_eq!(snapshot.live.len(), 2);
        assert!(snapshot.evictable.contains(&ObjectId(2)));
    }

    #[test]
    fn test_delete_updates_tracker() {
        let pipeline = pipeline();
        pipeline
            .commit(
                TransactionRecord::builder(NodeId::new("c1"), TransactionId(1))
                    .change(ObjectChange::created(ObjectId(5))),
                &[ManagedObject::new(ObjectId(5), ObjectType::Map)],
                &[],
            )
            .unwrap();
        pipeline
            .commit(
                TransactionRecord::builder(NodeId::new("server"), TransactionId(2)),
                &[],
                &[ObjectId(5)],
            )
            .unwrap();

        assert_eq!(pipeline.tracker().live_count().unwrap(), 0);
        assert!(!pipeline.objects().contains(ObjectId(5)).unwrap());
    }

    #[test]
    fn test_unreferenced_write_is_rejected() {
        let pipeline = pipeline();
        let err = pipeline
            .commit(
                TransactionRecord::builder(NodeId::new("c1"), TransactionId(1)),
                &[ManagedObject::new(ObjectId(9), ObjectType::Physical)],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::AssertionFailed(_)));
        assert_eq!(pipeline.sequencer().peek(), GlobalTransactionId(1));
    }
}
