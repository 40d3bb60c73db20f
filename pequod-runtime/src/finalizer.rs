//! Finalizer lifecycle for graph records.
//!
//! A graph record's finalizer exists for one reason: the owning instance's
//! inventory tracker has to be drained before Kubernetes is allowed to
//! delete the record, or a restart between delete and drain would strand
//! the objects it applied. Graph records are the only kind this engine ever
//! finalizes, so this is written against that one case directly rather than
//! as a reusable `Event<K>`/generic-reconciler abstraction.
use std::{str::FromStr, sync::Arc};

use json_patch::{AddOperation, PatchOperation, RemoveOperation, TestOperation};
use jsonptr::Pointer;
use kube::{
    api::{Api, Patch, PatchParams},
    Resource, ResourceExt,
};

use crate::{graph_reconciler::GraphReconcileError, inventory::InventoryRegistry, reconcile::Action, resources::GraphRecord};

/// Drive one finalizer-aware step for a graph record.
///
/// - finalizer present, not deleting: run `apply`.
/// - finalizer present, deleting: drain the owning instance's inventory
///   (keyed by `spec.source_ref.uid`), then remove the finalizer.
/// - finalizer absent, not deleting: add the finalizer; the resulting update
///   re-triggers a reconcile that lands in the first case.
/// - finalizer absent, deleting: nothing left to do.
///
/// `apply` must be idempotent: it may be retried after a restart, a failed
/// reconcile, or cancellation mid-`.await`.
pub async fn run<ApplyFut>(
    api: &Api<GraphRecord>,
    finalizer_name: &str,
    inventory: &InventoryRegistry,
    graph: Arc<GraphRecord>,
    apply: impl FnOnce(Arc<GraphRecord>) -> ApplyFut,
) -> Result<Action, GraphReconcileError>
where
    ApplyFut: std::future::Future<Output = Result<Action, GraphReconcileError>>,
{
    let finalizer_index = graph.finalizers().iter().position(|f| f == finalizer_name);
    let is_deleting = graph.meta().deletion_timestamp.is_some();

    match (finalizer_index, is_deleting) {
        (Some(_), false) => apply(graph).await,
        (Some(index), true) => {
            // Draining the inventory before removing the finalizer is what
            // keeps a delete from stranding objects this record applied.
            let name = named(&graph)?;
            inventory.remove(&graph.spec.source_ref.uid);
            remove_finalizer(api, &name, index, finalizer_name).await?;
            Ok(Action::await_change())
        }
        (None, false) => {
            add_finalizer(api, &graph, finalizer_name).await?;
            Ok(Action::await_change())
        }
        (None, true) => Ok(Action::await_change()),
    }
}

fn named(graph: &GraphRecord) -> Result<String, GraphReconcileError> {
    graph.meta().name.clone().ok_or_else(|| GraphReconcileError::UnnamedObject(format!("{graph:?}")))
}

/// Append `finalizer_name` via Test+Add, so a concurrent finalizer write
/// fails the patch instead of silently clobbering it (Kubernetes does not
/// deduplicate finalizer entries).
async fn add_finalizer(api: &Api<GraphRecord>, graph: &GraphRecord, finalizer_name: &str) -> Result<(), GraphReconcileError> {
    let current = graph.finalizers();
    let patch = if current.is_empty() {
        vec![
            test_op("/metadata/finalizers", serde_json::Value::Null),
            add_op("/metadata/finalizers", vec![finalizer_name].into()),
        ]
    } else {
        vec![
            test_op("/metadata/finalizers", current.into()),
            add_op("/metadata/finalizers/-", finalizer_name.into()),
        ]
    };
    let name = named(graph)?;
    api.patch(&name, &PatchParams::default(), &Patch::Json::<()>(json_patch::Patch(patch)))
        .await
        .map_err(GraphReconcileError::AddFinalizer)?;
    Ok(())
}

/// Remove the finalizer at `index` via Test+Remove, so a concurrent writer
/// that already touched the list fails the patch rather than a new
/// `Cleanup` silently overwriting it (the next watch event re-drives it).
async fn remove_finalizer(api: &Api<GraphRecord>, name: &str, index: usize, finalizer_name: &str) -> Result<(), GraphReconcileError> {
    let path = format!("/metadata/finalizers/{index}");
    let patch = vec![test_op(&path, finalizer_name.into()), PatchOperation::Remove(RemoveOperation { path: pointer(&path) })];
    api.patch(name, &PatchParams::default(), &Patch::Json::<()>(json_patch::Patch(patch)))
        .await
        .map_err(GraphReconcileError::RemoveFinalizer)?;
    Ok(())
}

fn test_op(path: &str, value: serde_json::Value) -> PatchOperation {
    PatchOperation::Test(TestOperation { path: pointer(path), value })
}

fn add_op(path: &str, value: serde_json::Value) -> PatchOperation {
    PatchOperation::Add(AddOperation { path: pointer(path), value })
}

fn pointer(path: &str) -> Pointer {
    Pointer::from_str(path).expect("finalizer patch paths are static and always well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalizer_index_is_found_by_position() {
        let finalizers = vec!["other.io/x".to_string(), "pequod.io/graph-finalizer".to_string()];
        let index = finalizers.iter().position(|f| f == "pequod.io/graph-finalizer");
        assert_eq!(index, Some(1));
    }

    #[test]
    fn absent_finalizer_is_not_found() {
        let finalizers = vec!["other.io/x".to_string()];
        assert!(finalizers.iter().position(|f| f == "pequod.io/graph-finalizer").is_none());
    }

    #[test]
    fn add_patch_uses_test_null_when_list_is_empty() {
        let patch = vec![
            test_op("/metadata/finalizers", serde_json::Value::Null),
            add_op("/metadata/finalizers", vec!["pequod.io/graph-finalizer"].into()),
        ];
        assert_eq!(patch.len(), 2);
        match &patch[0] {
            PatchOperation::Test(op) => assert_eq!(op.value, serde_json::Value::Null),
            _ => panic!("expected a test operation"),
        }
    }

    #[test]
    fn remove_patch_targets_the_given_index() {
        let patch = vec![
            test_op("/metadata/finalizers/2", "pequod.io/graph-finalizer".into()),
            PatchOperation::Remove(RemoveOperation { path: pointer("/metadata/finalizers/2") }),
        ];
        match &patch[1] {
            PatchOperation::Remove(op) => assert_eq!(op.path.to_string(), "/metadata/finalizers/2"),
            _ => panic!("expected a remove operation"),
        }
    }
}
