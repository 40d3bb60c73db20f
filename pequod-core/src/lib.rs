//! Data model for the Pequod graph-execution engine.
//!
//! This crate has no cluster I/O: it defines the rendered graph record, the
//! per-node and per-graph runtime state, the inventory item, and content
//! hashing. `pequod-runtime` builds the engine on top of these types.

pub mod graph;
pub mod gvk;
pub mod hash;
pub mod inventory;
pub mod state;

pub use gvk::{GroupVersionKind, ObjectIdentity, ParseGroupVersionError};
pub use hash::ContentHash;
pub use inventory::{InventoryItem, InventoryStatus};
