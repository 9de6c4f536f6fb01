// ============================================================================
// GraphMesh Library
// ============================================================================
//
// Core of a replicated shared object graph:
//
//   transaction  immutable commit records, pruned views, global sequencing
//   storage      managed-map backing store, object-id set tracking,
//                thread-affine store transactions
//   cluster      server groups, failover, active -> passive relay
//   nonstop      client cache operations bounded by a timeout policy
//
// ============================================================================

pub mod cluster;
pub mod core;
pub mod nonstop;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use core::{
    GlobalTransactionId, GraphError, NodeId, ObjectId, ObjectIdSet, Result, ServerTransactionId,
    TransactionId,
};

pub use transaction::{
    ChangeAction, CommitPipeline, GlobalTransactionIdSequencer, ObjectChange, ShippedTransaction,
    TransactionRecord, TransactionRecordBuilder, TransactionView, prune_for_replica,
};

pub use storage::{
    ManagedObject, MutationObserver, ObjectIdSetTracker, ObjectMap, ObjectStore, ObjectType,
    PersistenceTransaction, PersistenceTransactionProvider, PersistenceTransactionState,
    StoreConfig,
};

pub use cluster::{
    ClusterTopology, GroupConfig, GroupId, HaMode, InMemoryForwarder, Node, PassiveForwarder,
    ReplicationPolicy, ServerGroup, TransactionRelay,
};

pub use nonstop::{NonStopCache, NonStopConfig, NonStopTimeoutBehavior};
