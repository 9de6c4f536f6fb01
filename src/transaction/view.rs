// ============================================================================
// Transaction Views (Pruning)
// ============================================================================
//
// A view narrows one committed record for one downstream consumer: a lagging
// passive, a search index, a partial-interest client. It carries its own
// change list and object-id sets and falls through to the wrapped record for
// everything else. Ordering marks are reported absent: a partial view cannot
// vouch for global ordering completeness.
//
// ============================================================================

use super::change::ObjectChange;
use super::record::{
    DmiDescriptor, MetaDataDescriptor, NotifyEvent, TransactionKind, TransactionRecord,
};
use crate::core::{
    BatchId, GlobalTransactionId, GraphError, LockId, NodeId, ObjectId, ObjectIdSet, Result,
    SequenceId, ServerTransactionId, TransactionId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{Level, event};

/// Read-only projection of a `TransactionRecord`.
#[derive(Debug, Clone)]
pub struct TransactionView {
    record: Arc<TransactionRecord>,
    changes: Vec<ObjectChange>,
    referenced_ids: ObjectIdSet,
    new_ids: ObjectIdSet,
}

impl TransactionView {
    /// Project `record` down to `pruned_changes` and the given id sets.
    ///
    /// # Errors
    /// `InvalidProjection` if the changes are not a sub-sequence of the
    /// record's changes, or either id set is not a subset of its counterpart.
    pub fn project(
        record: Arc<TransactionRecord>,
        pruned_changes: Vec<ObjectChange>,
        referenced_ids: ObjectIdSet,
        new_ids: ObjectIdSet,
    ) -> Result<Self> {
        if !is_subsequence(&pruned_changes, record.changes()) {
            return Err(GraphError::InvalidProjection(format!(
                "changes of {} are not a sub-sequence of the original",
                record.server_transaction_id()
            )));
        }
        if !referenced_ids.is_subset(record.referenced_object_ids()) {
            return Err(GraphError::InvalidProjection(format!(
                "referenced ids of {} exceed the original set",
                record.server_transaction_id()
            )));
        }
        if !new_ids.is_subset(record.new_object_ids()) || !new_ids.is_subset(&referenced_ids) {
            return Err(GraphError::InvalidProjection(format!(
                "new ids of {} must lie within the original new ids and the projected references",
                record.server_transaction_id()
            )));
        }

        Ok(Self {
            record,
            changes: pruned_changes,
            referenced_ids,
            new_ids,
        })
    }

    /// The record this view projects.
    pub fn record(&self) -> &Arc<TransactionRecord> {
        &self.record
    }

    pub fn changes(&self) -> &[ObjectChange] {
        &self.changes
    }

    pub fn referenced_object_ids(&self) -> &ObjectIdSet {
        &self.referenced_ids
    }

    pub fn new_object_ids(&self) -> &ObjectIdSet {
        &self.new_ids
    }

    /// Always absent on a view.
    pub fn high_water_marks(&self) -> Option<&[u64]> {
        None
    }

    /// A view never redefines the identity of the transaction it projects.
    pub fn assign_global_id(&self, gid: GlobalTransactionId) -> Result<()> {
        Err(GraphError::UnsupportedOperation(format!(
            "cannot assign {} through a pruned view of {}",
            gid,
            self.record.server_transaction_id()
        )))
    }

    pub fn server_transaction_id(&self) -> &ServerTransactionId {
        self.record.server_transaction_id()
    }

    pub fn source_id(&self) -> &NodeId {
        self.record.source_id()
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.record.transaction_id()
    }

    pub fn global_transaction_id(&self) -> Option<GlobalTransactionId> {
        self.record.global_transaction_id()
    }

    pub fn client_sequence_id(&self) -> SequenceId {
        self.record.client_sequence_id()
    }

    pub fn batch_id(&self) -> BatchId {
        self.record.batch_id()
    }

    pub fn lock_ids(&self) -> &BTreeSet<LockId> {
        self.record.lock_ids()
    }

    pub fn new_roots(&self) -> &BTreeMap<String, ObjectId> {
        self.record.new_roots()
    }

    pub fn notifies(&self) -> &BTreeSet<NotifyEvent> {
        self.record.notifies()
    }

    pub fn dmi_descriptors(&self) -> &[DmiDescriptor] {
        self.record.dmi_descriptors()
    }

    pub fn metadata(&self) -> &[MetaDataDescriptor] {
        self.record.metadata()
    }

    pub fn kind(&self) -> TransactionKind {
        self.record.kind()
    }

    pub fn is_eviction(&self) -> bool {
        self.record.is_eviction()
    }

    pub fn is_active_txn(&self) -> bool {
        self.record.is_active_txn()
    }

    pub fn is_resent(&self) -> bool {
        self.record.is_resent()
    }

    pub fn is_search_enabled(&self) -> bool {
        self.record.is_search_enabled()
    }

    pub fn num_application_txn(&self) -> u32 {
        self.record.num_application_txn()
    }

    pub fn ignored_broadcast_object_ids(&self) -> &ObjectIdSet {
        self.record.ignored_broadcast_object_ids()
    }
}

fn is_subsequence(candidate: &[ObjectChange], original: &[ObjectChange]) -> bool {
    let mut remaining = original.iter();
    candidate
        .iter()
        .all(|wanted| remaining.any(|change| change == wanted))
}

/// What actually travels to a downstream consumer.
#[derive(Debug, Clone)]
pub enum ShippedTransaction {
    Full(Arc<TransactionRecord>),
    Pruned(TransactionView),
}

impl ShippedTransaction {
    pub fn record(&self) -> &Arc<TransactionRecord> {
        match self {
            ShippedTransaction::Full(record) => record,
            ShippedTransaction::Pruned(view) => view.record(),
        }
    }

    pub fn is_pruned(&self) -> bool {
        matches!(self, ShippedTransaction::Pruned(_))
    }

    pub fn changes(&self) -> &[ObjectChange] {
        match self {
            ShippedTransaction::Full(record) => record.changes(),
            ShippedTransaction::Pruned(view) => view.changes(),
        }
    }

    pub fn referenced_object_ids(&self) -> &ObjectIdSet {
        match self {
            ShippedTransaction::Full(record) => record.referenced_object_ids(),
            ShippedTransaction::Pruned(view) => view.referenced_object_ids(),
        }
    }

    pub fn new_object_ids(&self) -> &ObjectIdSet {
        match self {
            ShippedTransaction::Full(record) => record.new_object_ids(),
            ShippedTransaction::Pruned(view) => view.new_object_ids(),
        }
    }

    pub fn high_water_marks(&self) -> Option<&[u64]> {
        match self {
            ShippedTransaction::Full(record) => record.high_water_marks(),
            ShippedTransaction::Pruned(view) => view.high_water_marks(),
        }
    }

    pub fn global_transaction_id(&self) -> Option<GlobalTransactionId> {
        self.record().global_transaction_id()
    }

    pub fn server_transaction_id(&self) -> &ServerTransactionId {
        self.record().server_transaction_id()
    }
}

/// Narrow `record` for a passive that has already synchronised `synced`.
///
/// Changes to objects the passive has not received yet are dropped (they
/// arrive later in full through object sync); objects created by this
/// transaction are always kept. Returns the record itself when nothing
/// needed pruning.
pub fn prune_for_replica(
    record: &Arc<TransactionRecord>,
    synced: &ObjectIdSet,
) -> Result<ShippedTransaction> {
    let kept: Vec<ObjectChange> = record
        .changes()
        .iter()
        .filter(|change| change.is_new() || synced.contains(&change.object_id()))
        .cloned()
        .collect();

    if kept.len() == record.changes().len() {
        return Ok(ShippedTransaction::Full(Arc::clone(record)));
    }

    let original_refs = record.referenced_object_ids();
    let mut referenced = ObjectIdSet::new();
    for change in &kept {
        referenced.insert(change.object_id());
        for target in change.referenced_targets() {
            if original_refs.contains(&target) {
                referenced.insert(target);
            }
        }
    }
    let new_ids = referenced.clone().intersection(record.new_object_ids().clone());

    event!(
        Level::DEBUG,
        txn = %record.server_transaction_id(),
        kept = kept.len(),
        dropped = record.changes().len() - kept.len(),
        "pruned transaction for replica"
    );

    TransactionView::project(Arc::clone(record), kept, referenced, new_ids)
        .map(ShippedTransaction::Pruned)
}
