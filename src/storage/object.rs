// ============================================================================
// Managed Objects
// ============================================================================
//
// Stored layout: [object id: u64 big-endian][type tag: u8][MessagePack body]
//
// ============================================================================

use crate::core::{GraphError, ObjectId, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const HEADER_LEN: usize = 9;
const TYPE_TAG_OFFSET: usize = 8;

/// Kind of state a managed object holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Physical,
    Array,
    List,
    Map,
    SortedMap,
    Set,
    /// Partitioned concurrent map, participates in eviction
    ConcurrentMap,
    /// Server-side cache map, participates in eviction
    ServerMap,
}

impl ObjectType {
    pub fn tag(&self) -> u8 {
        match self {
            ObjectType::Physical => 1,
            ObjectType::Array => 2,
            ObjectType::List => 3,
            ObjectType::Map => 4,
            ObjectType::SortedMap => 5,
            ObjectType::Set => 6,
            ObjectType::ConcurrentMap => 7,
            ObjectType::ServerMap => 8,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectType::Physical),
            2 => Some(ObjectType::Array),
            3 => Some(ObjectType::List),
            4 => Some(ObjectType::Map),
            5 => Some(ObjectType::SortedMap),
            6 => Some(ObjectType::Set),
            7 => Some(ObjectType::ConcurrentMap),
            8 => Some(ObjectType::ServerMap),
            _ => None,
        }
    }

    pub fn is_evictable(&self) -> bool {
        matches!(self, ObjectType::ConcurrentMap | ObjectType::ServerMap)
    }

    /// Collections whose contents are persisted separately from the object
    /// and support size/iteration on the server.
    pub fn is_persistent_collection(&self) -> bool {
        matches!(
            self,
            ObjectType::Map
                | ObjectType::SortedMap
                | ObjectType::Set
                | ObjectType::ConcurrentMap
                | ObjectType::ServerMap
        )
    }
}

/// Classifies a stored value. Supplied by the store since the layout is
/// store-format specific.
pub type TypeClassifier = fn(ObjectId, &[u8]) -> Result<ObjectType>;

/// Classifier for values written by `ManagedObject::encode`.
pub fn header_classifier(object_id: ObjectId, value: &[u8]) -> Result<ObjectType> {
    let tag = *value.get(TYPE_TAG_OFFSET).ok_or_else(|| {
        GraphError::SerializationError(format!(
            "value for {} is {} bytes, shorter than the object header",
            object_id,
            value.len()
        ))
    })?;
    ObjectType::from_tag(tag).ok_or(GraphError::UnknownObjectType { object_id, tag })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ManagedBody {
    version: u64,
    fields: BTreeMap<String, serde_json::Value>,
}

/// Server-side state of one shared object.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedObject {
    pub id: ObjectId,
    pub object_type: ObjectType,
    pub version: u64,
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl ManagedObject {
    pub fn new(id: ObjectId, object_type: ObjectType) -> Self {
        Self {
            id,
            object_type,
            version: 1,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec(&ManagedBody {
            version: self.version,
            fields: self.fields.clone(),
        })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&self.id.as_u64().to_be_bytes());
        bytes.push(self.object_type.tag());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(GraphError::SerializationError(format!(
                "managed object is {} bytes, header needs {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let mut raw_id = [0u8; 8];
        raw_id.copy_from_slice(&bytes[..TYPE_TAG_OFFSET]);
        let id = ObjectId(u64::from_be_bytes(raw_id));
        let object_type = header_classifier(id, bytes)?;
        let body: ManagedBody = rmp_serde::from_slice(&bytes[HEADER_LEN..])?;
        Ok(Self {
            id,
            object_type,
            version: body.version,
            fields: body.fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_table_is_closed() {
        for tag in 0..=u8::MAX {
            if let Some(object_type) = ObjectType::from_tag(tag) {
                assert_eq!(object_type.tag(), tag);
            }
        }
        assert!(ObjectType::from_tag(0).is_none());
    }

    #[test]
    fn test_evictable_types_are_collections() {
        for tag in 1..=8 {
            let object_type = ObjectType::from_tag(tag).unwrap();
            if object_type.is_evictable() {
                assert!(object_type.is_persistent_collection());
            }
        }
        assert!(!ObjectType::List.is_persistent_collection());
    }

    #[test]
    fn test_header_classifier_reads_encoded_tag() {
        let object = ManagedObject::new(ObjectId(0x0102), ObjectType::ServerMap)
            .with_field("size", json!(3));
        let bytes = object.encode().unwrap();
        assert_eq!(header_classifier(object.id, &bytes).unwrap(), ObjectType::ServerMap);
        assert_eq!(ManagedObject::decode(&bytes).unwrap(), object);
    }

    #[test]
    fn test_header_classifier_rejects_unknown_tag() {
        let mut bytes = ManagedObject::new(ObjectId(5), ObjectType::Map).encode().unwrap();
        bytes[TYPE_TAG_OFFSET] = 200;
        let err = header_classifier(ObjectId(5), &bytes).unwrap_err();
        assert_eq!(err, GraphError::UnknownObjectType { object_id: ObjectId(5), tag: 200 });
        assert!(ManagedObject::decode(&bytes).is_err());
        assert!(header_classifier(ObjectId(5), &[0u8; 4]).is_err());
    }
}
