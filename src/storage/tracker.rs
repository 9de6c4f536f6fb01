// ============================================================================
// Object-Identifier Set Tracker
// ============================================================================
//
// Observes the object map and keeps three id sets in step with it:
// live, evictable, and collection-typed. The latter two are always subsets
// of live. All three change together under one lock, so a snapshot always
// reflects a single point in the commit stream.
//
// ============================================================================

use super::engine::{MutationMetadata, MutationObserver};
use super::object::TypeClassifier;
use crate::core::{ObjectId, ObjectIdSet, Result};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
struct TrackedSets {
    live: ObjectIdSet,
    evictable: ObjectIdSet,
    collections: ObjectIdSet,
}

/// Consistent copy of all three sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSnapshot {
    pub live: ObjectIdSet,
    pub evictable: ObjectIdSet,
    pub collections: ObjectIdSet,
}

pub struct ObjectIdSetTracker {
    classifier: TypeClassifier,
    sets: Mutex<TrackedSets>,
}

impl fmt::Debug for ObjectIdSetTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIdSetTracker")
            .field("sets", &self.sets)
            .finish_non_exhaustive()
    }
}

impl ObjectIdSetTracker {
    pub fn new(classifier: TypeClassifier) -> Self {
        Self {
            classifier,
            sets: Mutex::new(TrackedSets::default()),
        }
    }

    /// Classify and record a stored object.
    ///
    /// # Errors
    /// Fails (and records nothing) when the value cannot be classified.
    pub fn on_added(&self, key: u64, value: &[u8], _metadata: &MutationMetadata) -> Result<()> {
        let id = ObjectId(key);
        let object_type = (self.classifier)(id, value)?;

        let mut sets = self.sets.lock()?;
        if object_type.is_evictable() {
            sets.evictable.insert(id);
        } else {
            sets.evictable.remove(&id);
        }
        if object_type.is_persistent_collection() {
            sets.collections.insert(id);
        } else {
            sets.collections.remove(&id);
        }
        sets.live.insert(id);
        Ok(())
    }

    /// Drop the id from every set. Absent ids are ignored.
    pub fn on_removed(&self, key: u64, _value: &[u8], _metadata: &MutationMetadata) -> Result<()> {
        let id = ObjectId(key);
        let mut sets = self.sets.lock()?;
        sets.evictable.remove(&id);
        sets.collections.remove(&id);
        sets.live.remove(&id);
        Ok(())
    }

    /// Observer to register on the object map.
    pub fn observer(self: &Arc<Self>) -> MutationObserver {
        let added = Arc::clone(self);
        let removed = Arc::clone(self);
        MutationObserver::new(
            move |key, value, metadata| added.on_added(key, value, metadata),
            move |key, value, metadata| removed.on_removed(key, value, metadata),
        )
    }

    pub fn object_id_snapshot(&self) -> Result<ObjectIdSet> {
        Ok(self.sets.lock()?.live.clone())
    }

    pub fn evictable_snapshot(&self) -> Result<ObjectIdSet> {
        Ok(self.sets.lock()?.evictable.clone())
    }

    pub fn collection_snapshot(&self) -> Result<ObjectIdSet> {
        Ok(self.sets.lock()?.collections.clone())
    }

    pub fn snapshot(&self) -> Result<TrackedSnapshot> {
        let sets = self.sets.lock()?.clone();
        Ok(TrackedSnapshot {
            live: sets.live,
            evictable: sets.evictable,
            collections: sets.collections,
        })
    }

    pub fn live_count(&self) -> Result<usize> {
        Ok(self.sets.lock()?.live.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GraphError;
    use crate::storage::object::{ManagedObject, ObjectType, header_classifier};

    fn encoded(id: u64, object_type: ObjectType) -> Vec<u8> {
        ManagedObject::new(ObjectId(id), object_type).encode().unwrap()
    }

    #[test]
    fn test_classifies_on_add() {
        let tracker = ObjectIdSetTracker::new(header_classifier);
        let meta = MutationMetadata::new();
        tracker.on_added(1, &encoded(1, ObjectType::Physical), &meta).unwrap();
        tracker.on_added(2, &encoded(2, ObjectType::Map), &meta).unwrap();
        tracker.on_added(3, &encoded(3, ObjectType::ServerMap), &meta).unwrap();

        let snapshot = tracker.snapshot().unwrap();
        assert_eq!(snapshot.live.len(), 3);
        assert_eq!(snapshot.collections, [ObjectId(2), ObjectId(3)].into_iter().collect());
        assert_eq!(snapshot.evictable, [ObjectId(3)].into_iter().collect());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let tracker = ObjectIdSetTracker::new(header_classifier);
        let meta = MutationMetadata::new();
        tracker.on_added(3, &encoded(3, ObjectType::ConcurrentMap), &meta).unwrap();

        tracker.on_removed(3, &[], &meta).unwrap();
        tracker.on_removed(3, &[], &meta).unwrap();
        tracker.on_removed(42, &[], &meta).unwrap();

        let snapshot = tracker.snapshot().unwrap();
        assert!(snapshot.live.is_empty());
        assert!(snapshot.evictable.is_empty());
        assert!(snapshot.collections.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_fatal_and_records_nothing() {
        let tracker = ObjectIdSetTracker::new(header_classifier);
        let mut bytes = encoded(7, ObjectType::Map);
        bytes[8] = 0;

        let err = tracker.on_added(7, &bytes, &MutationMetadata::new()).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, GraphError::UnknownObjectType { tag: 0, .. }));
        assert_eq!(tracker.live_count().unwrap(), 0);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let tracker = ObjectIdSetTracker::new(header_classifier);
        let meta = MutationMetadata::new();
        tracker.on_added(1, &encoded(1, ObjectType::Set), &meta).unwrap();
        let before = tracker.object_id_snapshot().unwrap();

        tracker.on_added(2, &encoded(2, ObjectType::Set), &meta).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(tracker.collection_snapshot().unwrap().len(), 2);
        assert!(tracker.evictable_snapshot().unwrap().is_empty());
    }
}
