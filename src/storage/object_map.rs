use super::memory::StoreMap;
use super::object::ManagedObject;
use crate::core::{ObjectId, Result};
use std::sync::Arc;

/// Typed view over a raw store map holding encoded managed objects.
#[derive(Debug, Clone)]
pub struct ObjectMap {
    backing: Arc<StoreMap>,
}

impl ObjectMap {
    pub fn new(backing: Arc<StoreMap>) -> Self {
        Self { backing }
    }

    pub fn put(&self, object: &ManagedObject) -> Result<()> {
        let bytes = object.encode()?;
        self.backing.put(object.id.as_u64(), bytes)
    }

    pub fn get(&self, id: ObjectId) -> Result<Option<ManagedObject>> {
        match self.backing.get(id.as_u64())? {
            Some(bytes) => ManagedObject::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: ObjectId) -> Result<bool> {
        self.backing.remove(id.as_u64())
    }

    pub fn remove_all(&self, ids: impl IntoIterator<Item = ObjectId>) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.remove(id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn contains(&self, id: ObjectId) -> Result<bool> {
        self.backing.contains_key(id.as_u64())
    }

    pub fn len(&self) -> Result<usize> {
        self.backing.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.backing.is_empty()
    }

    pub fn ids(&self) -> Result<Vec<ObjectId>> {
        Ok(self.backing.keys()?.into_iter().map(ObjectId).collect())
    }

    pub fn clear(&self) -> Result<()> {
        self.backing.clear()
    }
}
