// ============================================================================
// Transaction Module
// ============================================================================
//
// Committed transaction records, the narrowed views derived from them for
// downstream consumers, and the pipeline that produces records from store
// commits.
//
// ============================================================================

pub mod change;
pub mod pipeline;
pub mod record;
pub mod sequencer;
pub mod view;

pub use change::{ChangeAction, ObjectChange};
pub use pipeline::{CommitPipeline, OBJECT_MAP_NAME};
pub use record::{
    DmiDescriptor, MetaDataDescriptor, NotifyEvent, TransactionKind, TransactionRecord,
    TransactionRecordBuilder,
};
pub use sequencer::GlobalTransactionIdSequencer;
pub use view::{ShippedTransaction, TransactionView, prune_for_replica};
