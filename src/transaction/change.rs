// ============================================================================
// Object Change Entries
// ============================================================================
//
// One entry per object touched by a committed transaction. The encoding of
// individual field mutations is opaque to the commit core: actions carry
// already-serialised values.
//
// ============================================================================

use crate::core::ObjectId;
use serde::{Deserialize, Serialize};

/// A single field or collection mutation applied to one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeAction {
    /// Assign a physical field
    SetField {
        field: String,
        value: serde_json::Value,
    },

    /// Put a mapping into a collection-typed object
    CollectionPut {
        key: serde_json::Value,
        value: serde_json::Value,
    },

    /// Remove a mapping from a collection-typed object
    CollectionRemove { key: serde_json::Value },

    /// Drop every element of a collection-typed object
    CollectionClear,

    /// Reference another shared object from a field
    SetReference { field: String, target: ObjectId },
}

/// All mutations a transaction made to one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectChange {
    object_id: ObjectId,
    /// Version of the object this change produces
    version: u64,
    /// True when the transaction created the object
    is_new: bool,
    actions: Vec<ChangeAction>,
}

impl ObjectChange {
    pub fn new(object_id: ObjectId, version: u64) -> Self {
        Self {
            object_id,
            version,
            is_new: false,
            actions: Vec::new(),
        }
    }

    pub fn created(object_id: ObjectId) -> Self {
        Self {
            object_id,
            version: 1,
            is_new: true,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ChangeAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn actions(&self) -> &[ChangeAction] {
        &self.actions
    }

    /// Objects referenced from this change besides the changed object itself.
    pub fn referenced_targets(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.actions.iter().filter_map(|action| match action {
            ChangeAction::SetReference { target, .. } => Some(*target),
            _ => None,
        })
    }

    /// True when the change only touches collection contents
    pub fn is_collection_change(&self) -> bool {
        !self.actions.is_empty()
            && self.actions.iter().all(|action| {
                matches!(
                    action,
                    ChangeAction::CollectionPut { .. }
                        | ChangeAction::CollectionRemove { .. }
                        | ChangeAction::CollectionClear
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_referenced_targets() {
        let change = ObjectChange::new(ObjectId(1), 3)
            .with_action(ChangeAction::SetField {
                field: "name".into(),
                value: json!("alice"),
            })
            .with_action(ChangeAction::SetReference {
                field: "friend".into(),
                target: ObjectId(9),
            });

        assert_eq!(change.referenced_targets().collect::<Vec<_>>(), vec![ObjectId(9)]);
        assert!(!change.is_collection_change());
    }

    #[test]
    fn test_collection_change_classification() {
        let change = ObjectChange::created(ObjectId(5))
            .with_action(ChangeAction::CollectionPut {
                key: json!("k"),
                value: json!(1),
            })
            .with_action(ChangeAction::CollectionClear);
        assert!(change.is_new());
        assert!(change.is_collection_change());
        assert!(!ObjectChange::new(ObjectId(5), 2).is_collection_change());
    }
}
