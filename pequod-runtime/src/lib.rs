#![deny(clippy::all)]
// Triggered by kube-derive and schemars derive output
#![allow(clippy::default_trait_access)]

pub mod adopter;
pub mod applier;
pub mod collaborators;
pub mod dag;
pub mod dynamic_watcher;
pub mod events;
pub mod finalizer;
pub mod graph_reconciler;
pub mod instance_reconciler;
pub mod inventory;
pub mod manager;
pub mod metrics;
pub mod pruner;
pub mod readiness;
pub mod reconcile;
pub mod resources;

pub use manager::{Manager, ManagerConfig};
