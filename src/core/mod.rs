pub mod error;
pub mod types;

pub use error::{GraphError, Result};
pub use types::{
    BatchId, GlobalTransactionId, LockId, NodeId, ObjectId, ObjectIdSet, SequenceId,
    ServerTransactionId, TransactionId,
};
