// ============================================================================
// Committed Transaction Record
// ============================================================================
//
// Immutable description of one committed unit of work. Built once by the
// commit pipeline through `TransactionRecordBuilder`; afterwards the only
// permitted transition is the single assignment of the global id.
//
// ============================================================================

use super::change::ObjectChange;
use crate::core::{
    BatchId, GlobalTransactionId, GraphError, LockId, NodeId, ObjectId, ObjectIdSet, Result,
    SequenceId, ServerTransactionId, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Why a transaction was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Regular application transaction
    Normal,
    /// Transaction under a concurrent lock; may be applied out of lock order
    Concurrent,
    /// Client waits for the commit to be acknowledged by every replica
    SyncWrite,
    /// Produced by the server while evicting cached object state
    Eviction,
}

impl Default for TransactionKind {
    fn default() -> Self {
        Self::Normal
    }
}

/// A wait/notify signal delivered once the transaction commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NotifyEvent {
    pub lock_id: LockId,
    pub waiter: NodeId,
    /// Wake every waiter on the lock rather than one
    pub all: bool,
}

/// An out-of-band method invocation to run on other clients after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmiDescriptor {
    pub receiver: ObjectId,
    pub method: String,
    /// Fault the receiver in on clients that do not hold it
    pub fault_receiver: bool,
}

/// Search-index attributes attached to an object by the transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaDataDescriptor {
    pub object_id: ObjectId,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug)]
pub struct TransactionRecord {
    server_txn_id: ServerTransactionId,
    global_id: OnceLock<GlobalTransactionId>,
    client_sequence: SequenceId,
    batch_id: BatchId,
    changes: Vec<ObjectChange>,
    lock_ids: BTreeSet<LockId>,
    referenced_ids: ObjectIdSet,
    new_ids: ObjectIdSet,
    new_roots: BTreeMap<String, ObjectId>,
    notifies: BTreeSet<NotifyEvent>,
    dmi_descriptors: Vec<DmiDescriptor>,
    metadata: Vec<MetaDataDescriptor>,
    kind: TransactionKind,
    active_txn: bool,
    resent: bool,
    search_enabled: bool,
    num_application_txn: u32,
    high_water_marks: Vec<u64>,
    ignored_broadcast_ids: ObjectIdSet,
}

impl TransactionRecord {
    pub fn builder(source: NodeId, txn_id: TransactionId) -> TransactionRecordBuilder {
        TransactionRecordBuilder::new(source, txn_id)
    }

    pub fn server_transaction_id(&self) -> &ServerTransactionId {
        &self.server_txn_id
    }

    pub fn source_id(&self) -> &NodeId {
        &self.server_txn_id.source
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.server_txn_id.txn_id
    }

    /// The global id, or `None` while the record awaits sequencing.
    pub fn global_transaction_id(&self) -> Option<GlobalTransactionId> {
        self.global_id.get().copied()
    }

    /// Assign the global id. Fails if one was already assigned.
    pub fn assign_global_id(&self, gid: GlobalTransactionId) -> Result<()> {
        self.global_id.set(gid).map_err(|_| {
            GraphError::IllegalState(format!(
                "Global transaction id already assigned for {}: existing={:?}, attempted={}",
                self.server_txn_id,
                self.global_id.get(),
                gid
            ))
        })
    }

    pub fn client_sequence_id(&self) -> SequenceId {
        self.client_sequence
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn changes(&self) -> &[ObjectChange] {
        &self.changes
    }

    pub fn lock_ids(&self) -> &BTreeSet<LockId> {
        &self.lock_ids
    }

    pub fn referenced_object_ids(&self) -> &ObjectIdSet {
        &self.referenced_ids
    }

    pub fn new_object_ids(&self) -> &ObjectIdSet {
        &self.new_ids
    }

    pub fn new_roots(&self) -> &BTreeMap<String, ObjectId> {
        &self.new_roots
    }

    pub fn notifies(&self) -> &BTreeSet<NotifyEvent> {
        &self.notifies
    }

    pub fn dmi_descriptors(&self) -> &[DmiDescriptor] {
        &self.dmi_descriptors
    }

    pub fn metadata(&self) -> &[MetaDataDescriptor] {
        &self.metadata
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn is_eviction(&self) -> bool {
        self.kind == TransactionKind::Eviction
    }

    pub fn is_active_txn(&self) -> bool {
        self.active_txn
    }

    pub fn is_resent(&self) -> bool {
        self.resent
    }

    pub fn is_search_enabled(&self) -> bool {
        self.search_enabled
    }

    pub fn num_application_txn(&self) -> u32 {
        self.num_application_txn
    }

    /// Low-water/high-water ordering marks. Always present on a full record.
    pub fn high_water_marks(&self) -> Option<&[u64]> {
        Some(&self.high_water_marks)
    }

    pub fn ignored_broadcast_object_ids(&self) -> &ObjectIdSet {
        &self.ignored_broadcast_ids
    }
}

/// Assembles a `TransactionRecord` and checks its invariants on `build`.
#[derive(Debug)]
pub struct TransactionRecordBuilder {
    server_txn_id: ServerTransactionId,
    client_sequence: SequenceId,
    batch_id: BatchId,
    changes: Vec<ObjectChange>,
    lock_ids: BTreeSet<LockId>,
    extra_referenced: ObjectIdSet,
    new_roots: BTreeMap<String, ObjectId>,
    notifies: BTreeSet<NotifyEvent>,
    dmi_descriptors: Vec<DmiDescriptor>,
    metadata: Vec<MetaDataDescriptor>,
    kind: TransactionKind,
    active_txn: bool,
    resent: bool,
    search_enabled: bool,
    num_application_txn: u32,
    high_water_marks: Vec<u64>,
    ignored_broadcast_ids: ObjectIdSet,
}

impl TransactionRecordBuilder {
    pub fn new(source: NodeId, txn_id: TransactionId) -> Self {
        Self {
            server_txn_id: ServerTransactionId::new(source, txn_id),
            client_sequence: SequenceId(0),
            batch_id: BatchId(0),
            changes: Vec::new(),
            lock_ids: BTreeSet::new(),
            extra_referenced: ObjectIdSet::new(),
            new_roots: BTreeMap::new(),
            notifies: BTreeSet::new(),
            dmi_descriptors: Vec::new(),
            metadata: Vec::new(),
            kind: TransactionKind::Normal,
            active_txn: true,
            resent: false,
            search_enabled: false,
            num_application_txn: 1,
            high_water_marks: Vec::new(),
            ignored_broadcast_ids: ObjectIdSet::new(),
        }
    }

    pub fn client_sequence(mut self, sequence: SequenceId) -> Self {
        self.client_sequence = sequence;
        self
    }

    pub fn batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn change(mut self, change: ObjectChange) -> Self {
        self.changes.push(change);
        self
    }

    pub fn changes(mut self, changes: impl IntoIterator<Item = ObjectChange>) -> Self {
        self.changes.extend(changes);
        self
    }

    pub fn lock(mut self, lock_id: LockId) -> Self {
        self.lock_ids.insert(lock_id);
        self
    }

    /// Reference an object that the transaction reads but does not change.
    pub fn reference(mut self, object_id: ObjectId) -> Self {
        self.extra_referenced.insert(object_id);
        self
    }

    pub fn new_root(mut self, name: impl Into<String>, object_id: ObjectId) -> Self {
        self.new_roots.insert(name.into(), object_id);
        self
    }

    pub fn notify(mut self, event: NotifyEvent) -> Self {
        self.notifies.insert(event);
        self
    }

    pub fn dmi(mut self, descriptor: DmiDescriptor) -> Self {
        self.dmi_descriptors.push(descriptor);
        self
    }

    pub fn metadata(mut self, descriptor: MetaDataDescriptor) -> Self {
        self.metadata.push(descriptor);
        self
    }

    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn active_txn(mut self, active: bool) -> Self {
        self.active_txn = active;
        self
    }

    pub fn resent(mut self, resent: bool) -> Self {
        self.resent = resent;
        self
    }

    pub fn search_enabled(mut self, enabled: bool) -> Self {
        self.search_enabled = enabled;
        self
    }

    pub fn num_application_txn(mut self, count: u32) -> Self {
        self.num_application_txn = count;
        self
    }

    pub fn high_water_marks(mut self, marks: Vec<u64>) -> Self {
        self.high_water_marks = marks;
        self
    }

    pub fn ignore_broadcast(mut self, object_id: ObjectId) -> Self {
        self.ignored_broadcast_ids.insert(object_id);
        self
    }

    /// Derive the referenced/new sets from the changes and validate.
    ///
    /// # Errors
    /// `AssertionFailed` when a new root names an object neither created nor
    /// referenced, or when an ignored-broadcast id is not referenced.
    pub fn build(self) -> Result<TransactionRecord> {
        let mut referenced_ids = self.extra_referenced;
        let mut new_ids = ObjectIdSet::new();
        for change in &self.changes {
            referenced_ids.insert(change.object_id());
            if change.is_new() {
                new_ids.insert(change.object_id());
            }
        }

        for (name, root) in &self.new_roots {
            if !referenced_ids.contains(root) {
                return Err(GraphError::AssertionFailed(format!(
                    "Root '{}' points at {} which is not referenced by {}",
                    name, root, self.server_txn_id
                )));
            }
        }
        if let Some(stray) = self
            .ignored_broadcast_ids
            .iter()
            .find(|id| !referenced_ids.contains(*id))
        {
            return Err(GraphError::AssertionFailed(format!(
                "Ignored broadcast {} is not referenced by {}",
                stray, self.server_txn_id
            )));
        }

        Ok(TransactionRecord {
            server_txn_id: self.server_txn_id,
            global_id: OnceLock::new(),
            client_sequence: self.client_sequence,
            batch_id: self.batch_id,
            changes: self.changes,
            lock_ids: self.lock_ids,
            referenced_ids,
            new_ids,
            new_roots: self.new_roots,
            notifies: self.notifies,
            dmi_descriptors: self.dmi_descriptors,
            metadata: self.metadata,
            kind: self.kind,
            active_txn: self.active_txn,
            resent: self.resent,
            search_enabled: self.search_enabled,
            num_application_txn: self.num_application_txn,
            high_water_marks: self.high_water_marks,
            ignored_broadcast_ids: self.ignored_broadcast_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransactionRecord {
        TransactionRecord::builder(NodeId::new("client-1"), TransactionId(4))
            .batch(BatchId(2))
            .change(ObjectChange::created(ObjectId(10)))
            .change(ObjectChange::new(ObjectId(11), 5))
            .reference(ObjectId(12))
            .lock(LockId::new("lock-a"))
            .new_root("root", ObjectId(10))
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_ids_subset_of_referenced() {
        let record = sample();
        assert_eq!(record.new_object_ids().len(), 1);
        assert!(record.new_object_ids().is_subset(record.referenced_object_ids()));
        assert_eq!(record.referenced_object_ids().len(), 3);
    }

    #[test]
    fn test_global_id_assigned_once() {
        let record = sample();
        assert_eq!(record.global_transaction_id(), None);

        record.assign_global_id(GlobalTransactionId(100)).unwrap();
        assert_eq!(record.global_transaction_id(), Some(GlobalTransactionId(100)));

        let err = record.assign_global_id(GlobalTransactionId(101)).unwrap_err();
        assert!(matches!(err, GraphError::IllegalState(_)));
        assert_eq!(record.global_transaction_id(), Some(GlobalTransactionId(100)));
    }

    #[test]
    fn test_root_must_be_referenced() {
        let result = TransactionRecord::builder(NodeId::new("c"), TransactionId(1))
            .new_root("orphan", ObjectId(77))
            .build();
        assert!(matches!(result, Err(GraphError::AssertionFailed(_))));
    }

    #[test]
    fn test_eviction_kind() {
        let record = TransactionRecord::builder(NodeId::new("server"), TransactionId(1))
            .kind(TransactionKind::Eviction)
            .build()
            .unwrap();
        assert!(record.is_eviction());
        assert_eq!(record.high_water_marks(), Some(&[][..]));
    }
}
