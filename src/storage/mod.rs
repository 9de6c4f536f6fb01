pub mod engine;
pub mod memory;
pub mod object;
pub mod object_map;
pub mod tracker;
pub mod transaction;

pub use engine::{MutationCallback, MutationMetadata, MutationObserver, StoreEngine};
pub use memory::{ObjectStore, StoreConfig, StoreMap};
pub use object::{ManagedObject, ObjectType, TypeClassifier, header_classifier};
pub use object_map::ObjectMap;
pub use tracker::{ObjectIdSetTracker, TrackedSnapshot};
pub use transaction::{
    PersistenceTransaction, PersistenceTransactionProvider, PersistenceTransactionState,
    TransactionListener,
};
