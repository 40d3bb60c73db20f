//! The inventory item data model. Storage and locking live in
//! `pequod-runtime::inventory`; this module holds only the serializable record.
use serde::{Deserialize, Serialize};

use crate::{gvk::ObjectIdentity, hash::ContentHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum InventoryStatus {
    Applied,
    Adopted,
    Failed,
    Orphaned,
    Pruned,
}

/// A single applied object, tracked independently of whether the graph that
/// produced it still names it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct InventoryItem {
    /// Node id this item was applied for; stable across re-renders as long
    /// as the template keeps generating the same node id for the object.
    pub id: String,
    pub identity: ObjectIdentity,
    pub hash: ContentHash,
    pub status: InventoryStatus,
}

impl InventoryItem {
    pub fn new(id: impl Into<String>, identity: ObjectIdentity, hash: ContentHash, status: InventoryStatus) -> Self {
        Self {
            id: id.into(),
            identity,
            hash,
            status,
        }
    }
}
