//! Per-graph-record control loop: finalizer handling, validation, adoption,
//! DAG execution, and status reporting.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    core::{ErrorResponse, GroupVersionKind as KubeGvk},
    discovery::ApiResource,
    runtime::controller::Action as KubeAction,
    Resource, ResourceExt,
};
use pequod_core::{
    graph::{has_blocking_violations, NodeSpec, SourceRef, DEFAULT_FIELD_MANAGER},
    gvk::GroupVersionKind,
    hash::ContentHash,
    state::{Condition, GraphExecutionState, GraphPhase, NodePhase},
    InventoryItem, InventoryStatus,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    adopter::Adopter,
    dag::{BuildError, Dag, ExecutionOutcome, Executor},
    events::{EventRecorder, EventSource, GraphEvent},
    finalizer,
    inventory::InventoryRegistry,
    metrics::Metrics,
    pruner::{DeletionPolicy, PruneOptions, Pruner},
    reconcile::Action,
    resources::GraphRecord,
};

pub const DEFAULT_FINALIZER: &str = "pequod.io/graph-finalizer";

#[derive(Debug, Error)]
pub enum GraphReconcileError {
    #[error("graph record {0:?} has no name")]
    UnnamedObject(String),
    #[error("failed to add finalizer: {0}")]
    AddFinalizer(#[source] kube::Error),
    #[error("failed to remove finalizer: {0}")]
    RemoveFinalizer(#[source] kube::Error),
    #[error("failed to write graph record status: {source}")]
    StatusWrite {
        #[source]
        source: kube::Error,
    },
}

/// Everything a single graph reconcile needs, shared across every object of
/// this kind via a single `Arc`.
pub struct GraphReconcilerContext {
    pub client: kube::Client,
    pub adopter: Arc<Adopter>,
    pub executor: Arc<Executor>,
    pub inventory: Arc<InventoryRegistry>,
    pub pruner: Arc<Pruner>,
    pub metrics: Arc<Metrics>,
    pub event_source: EventSource,
    pub finalizer_name: String,
    pub requeue_interval: Duration,
}

/// Entry point wired into `kube::runtime::Controller::run`.
#[instrument(skip(graph, ctx), fields(graph = %graph.name_any()))]
pub async fn reconcile(graph: Arc<GraphRecord>, ctx: Arc<GraphReconcilerContext>) -> Result<KubeAction, GraphReconcileError> {
    let api: Api<GraphRecord> = match graph.namespace() {
        Some(ns) => Api::namespaced(ctx.client.clone(), &ns),
        None => Api::all(ctx.client.clone()),
    };
    let finalizer_name = ctx.finalizer_name.clone();
    let started = std::time::Instant::now();
    let result = finalizer::run(&api, &finalizer_name, &ctx.inventory, graph, |graph| apply(&ctx, &api, graph)).await;

    let result_label = if result.is_ok() { "success" } else { "error" };
    ctx.metrics.reconciles_total.with_label_values(&[result_label]).inc();
    ctx.metrics
        .reconcile_duration_seconds
        .with_label_values(&[result_label])
        .observe(started.elapsed().as_secs_f64());

    let action = result?;
    Ok(match action.requeue_after() {
        Some(duration) => KubeAction::requeue(duration),
        None => KubeAction::await_change(),
    })
}

pub fn error_policy(_graph: Arc<GraphRecord>, err: &GraphReconcileError, ctx: Arc<GraphReconcilerContext>) -> KubeAction {
    warn!(error = %err, "graph reconcile failed, retrying");
    KubeAction::requeue(ctx.requeue_interval)
}

async fn apply(
    ctx: &Arc<GraphReconcilerContext>,
    api: &Api<GraphRecord>,
    graph: Arc<GraphRecord>,
) -> Result<Action, GraphReconcileError> {
    let name = graph.meta().name.clone().ok_or_else(|| GraphReconcileError::UnnamedObject(format!("{graph:?}")))?;
    let generation = graph.meta().generation.unwrap_or_default();
    let current_status = graph.status.clone().unwrap_or_default();

    if matches!(current_status.phase, GraphPhase::Completed | GraphPhase::Failed) && current_status.observed_generation == generation {
        return Ok(Action::await_change());
    }

    let owner_ref = graph.controller_owner_ref(&());
    let nodes: Vec<NodeSpec> = graph
        .spec
        .nodes
        .iter()
        .cloned()
        .map(|mut node| {
            if let Some(owner_ref) = &owner_ref {
                inject_owner_reference(&mut node, owner_ref);
            }
            node
        })
        .collect();

    let events = EventRecorder::new(ctx.client.clone(), ctx.event_source.clone(), object_reference(&graph));

    if has_blocking_violations(&graph.spec.violations) {
        let status = failed_status_for_violations(generation);
        write_status(api, &name, &status).await?;
        let _ = events.publish(GraphEvent::PolicyViolation { violation_count: graph.spec.violations.len() }).await;
        return Ok(Action::await_change());
    }

    let dag = match Dag::build(nodes) {
        Ok(dag) => dag,
        Err(err) => {
            let status = failed_status(generation, &err);
            write_status(api, &name, &status).await?;
            let _ = events.publish(GraphEvent::ValidationFailed { message: err.to_string() }).await;
            return Ok(Action::await_change());
        }
    };

    let mut status = GraphExecutionState {
        phase: GraphPhase::Executing,
        observed_generation: generation,
        started_at: current_status.started_at.or(Some(Utc::now())),
        ..GraphExecutionState::pending()
    };
    write_status(api, &name, &status).await?;
    let _ = events.publish(GraphEvent::ExecutionStarted).await;

    let adoption_results = if let Some(adopt_spec) = &graph.spec.adopt {
        let results = ctx.adopter.adopt_all(adopt_spec, &graph.spec.nodes).await;
        for (resource_ref, result) in &results {
            match result {
                Ok(_outcome) => {
                    ctx.metrics.adoptions_total.with_label_values(&["success"]).inc();
                    info!(kind = %resource_ref.kind, name = %resource_ref.name, "adoption completed");
                    let _ = events
                        .publish(GraphEvent::ResourceAdopted { kind: resource_ref.kind.clone(), name: resource_ref.name.clone() })
                        .await;
                }
                Err(err) => {
                    ctx.metrics.adoptions_total.with_label_values(&["error"]).inc();
                    warn!(kind = %resource_ref.kind, name = %resource_ref.name, error = %err, "adoption failed, continuing execution");
                    let _ = events
                        .publish(GraphEvent::ResourceAdoptionFailed {
                            kind: resource_ref.kind.clone(),
                            name: resource_ref.name.clone(),
                            message: err.to_string(),
                        })
                        .await;
                }
            }
        }
        results
    } else {
        Vec::new()
    };

    ctx.metrics.dag_nodes.with_label_values(&[&name]).set(graph.spec.nodes.len() as f64);
    let cancel = CancellationToken::new();
    let dag_started = std::time::Instant::now();
    let (outcome, execution_state) = ctx.executor.run(dag, cancel).await;
    let dag_result_label = match outcome {
        ExecutionOutcome::Completed => "success",
        ExecutionOutcome::Failed | ExecutionOutcome::Cancelled => "error",
    };
    ctx.metrics
        .dag_execution_duration_seconds
        .with_label_values(&[dag_result_label])
        .observe(dag_started.elapsed().as_secs_f64());

    status.node_states = execution_state.node_states;
    for (resource_ref, result) in &adoption_results {
        let Ok(result) = result else { continue };
        let Some(node_id) = &result.node_id else { continue };
        if let Some(node_state) = status.node_states.get_mut(node_id) {
            node_state.adopted = true;
            node_state.adopted_at = Some(Utc::now());
            node_state.previous_managers = result.previous_managers.clone();
            let _ = resource_ref;
        }
    }
    status.recompute_phase();
    status.completed_at = Some(Utc::now());
    status.conditions.push(terminal_condition(outcome));

    reconcile_inventory(ctx, &graph, &name, &status).await;

    write_status(api, &name, &status).await?;

    let terminal_event = match outcome {
        ExecutionOutcome::Completed => GraphEvent::ExecutionCompleted,
        ExecutionOutcome::Failed => GraphEvent::ExecutionFailed,
        ExecutionOutcome::Cancelled => GraphEvent::ExecutionCancelled,
    };
    let _ = events.publish(terminal_event).await;

    if status.node_states.values().any(|s| s.phase == NodePhase::WaitingReady) {
        Ok(Action::requeue(ctx.requeue_interval))
    } else if outcome == ExecutionOutcome::Completed {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ctx.requeue_interval))
    }
}

/// Build an `Api<DynamicObject>` scoped to the instance a graph record was
/// rendered from, so its `status.inventory` can be read and patched the same
/// way any other dynamically-typed object is.
fn instance_api(client: kube::Client, source: &SourceRef) -> Option<Api<DynamicObject>> {
    let gvk = GroupVersionKind::from_api_version_kind(&source.api_version, &source.kind).ok()?;
    let kube_gvk = KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let resource = ApiResource::from_gvk(&kube_gvk);
    Some(match source.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    })
}

/// Read the owning instance's `status.inventory`, the seed a freshly-started
/// operator uses to rebuild its in-memory tracker.
async fn read_instance_inventory(client: kube::Client, source: &SourceRef) -> Option<Vec<InventoryItem>> {
    let api = instance_api(client, source)?;
    let instance = api.get_opt(&source.name).await.ok().flatten()?;
    let items = instance.data.get("status")?.get("inventory")?.clone();
    serde_json::from_value(items).ok()
}

/// Patch the owning instance's `status.inventory` with the tracker's current
/// snapshot, so the next operator restart can rebuild from it.
async fn write_instance_inventory(client: kube::Client, source: &SourceRef, items: Vec<InventoryItem>) {
    let Some(api) = instance_api(client, source) else { return };
    let patch = serde_json::json!({ "status": { "inventory": items } });
    match api
        .patch_status(&source.name, &PatchParams::apply(DEFAULT_FIELD_MANAGER).force(), &Patch::Merge(patch))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {}
        Err(err) => warn!(error = %err, "failed to persist inventory snapshot to instance status"),
    }
}

/// Record every Ready node into the owning instance's inventory, then prune
/// whatever the inventory still names but this render no longer does.
async fn reconcile_inventory(ctx: &Arc<GraphReconcilerContext>, graph: &GraphRecord, graph_name: &str, status: &GraphExecutionState) {
    let source = &graph.spec.source_ref;
    let tracker = if ctx.inventory.contains(&source.uid) {
        ctx.inventory.tracker_for(&source.uid, Vec::new)
    } else {
        let seed = read_instance_inventory(ctx.client.clone(), source).await.unwrap_or_default();
        ctx.inventory.tracker_for(&source.uid, || seed)
    };

    for node in &graph.spec.nodes {
        let Some(node_state) = status.node_states.get(&node.id) else { continue };
        if node_state.phase != NodePhase::Ready {
            continue;
        }
        let Ok(gvk) = GroupVersionKind::from_api_version_kind(&node.object.api_version, &node.object.kind) else { continue };
        let identity = pequod_core::gvk::ObjectIdentity::new(gvk, node.object.namespace.clone(), node.object.name.clone());
        let hash = ContentHash::of_object(&node.object.body);
        let item_status = if node_state.adopted { InventoryStatus::Adopted } else { InventoryStatus::Applied };
        tracker.record(InventoryItem::new(node.id.clone(), identity, hash, item_status));
    }

    let current_ids: std::collections::BTreeSet<String> = graph.spec.nodes.iter().map(|n| n.id.clone()).collect();
    let options = PruneOptions {
        deletion_policy: DeletionPolicy::Delete,
        ..PruneOptions::default()
    };
    match ctx.pruner.prune(&tracker, &current_ids, &options, Utc::now()).await {
        Ok(report) if !report.is_empty() => info!(graph = %graph_name, pruned = report.len(), "pruned orphaned objects"),
        Ok(_) => {}
        Err(err) => warn!(graph = %graph_name, error = %err, "prune pass failed"),
    }
    ctx.pruner.cleanup_orphaned(&tracker);
    let snapshot = tracker.snapshot();
    ctx.metrics.managed_objects.with_label_values(&[graph_name]).set(snapshot.len() as f64);
    write_instance_inventory(ctx.client.clone(), source, snapshot).await;
}

async fn write_status(api: &Api<GraphRecord>, name: &str, status: &GraphExecutionState) -> Result<(), GraphReconcileError> {
    let patch = serde_json::json!({ "status": status });
    match api
        .patch_status(name, &PatchParams::apply(DEFAULT_FIELD_MANAGER).force(), &Patch::Merge(patch))
        .await
    {
        Ok(_) => Ok(()),
        // A concurrent status writer lost the race; the next watch event re-drives this reconcile.
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Ok(()),
        Err(source) => Err(GraphReconcileError::StatusWrite { source }),
    }
}

fn failed_status(generation: i64, err: &BuildError) -> GraphExecutionState {
    GraphExecutionState {
        phase: GraphPhase::Failed,
        observed_generation: generation,
        completed_at: Some(Utc::now()),
        conditions: vec![Condition {
            type_: "Validated".into(),
            status: "False".into(),
            reason: "ValidationFailed".into(),
            message: err.to_string(),
            last_transition_time: Utc::now(),
        }],
        ..GraphExecutionState::pending()
    }
}

fn failed_status_for_violations(generation: i64) -> GraphExecutionState {
    GraphExecutionState {
        phase: GraphPhase::Failed,
        observed_generation: generation,
        completed_at: Some(Utc::now()),
        conditions: vec![Condition {
            type_: "Validated".into(),
            status: "False".into(),
            reason: "PolicyViolation".into(),
            message: "render produced a blocking policy violation".into(),
            last_transition_time: Utc::now(),
        }],
        ..GraphExecutionState::pending()
    }
}

fn terminal_condition(outcome: ExecutionOutcome) -> Condition {
    let (status, reason, message) = match outcome {
        ExecutionOutcome::Completed => ("True", "AllNodesReady", "every node reached Ready".to_string()),
        ExecutionOutcome::Failed => ("False", "NodeFailed", "one or more nodes entered Error".to_string()),
        ExecutionOutcome::Cancelled => ("False", "Cancelled", "execution was cancelled".to_string()),
    };
    Condition {
        type_: "Executed".into(),
        status: status.into(),
        reason: reason.into(),
        message,
        last_transition_time: Utc::now(),
    }
}

fn object_reference(graph: &GraphRecord) -> ObjectReference {
    ObjectReference {
        api_version: Some("pequod.io/v1alpha1".into()),
        kind: Some("GraphRecord".into()),
        name: graph.meta().name.clone(),
        namespace: graph.meta().namespace.clone(),
        uid: graph.meta().uid.clone(),
        resource_version: graph.meta().resource_version.clone(),
        ..Default::default()
    }
}

/// Append this graph record as a controlling owner on a node's object body,
/// so deleting the record cascades to every object it applied.
fn inject_owner_reference(node: &mut NodeSpec, owner_ref: &k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference) {
    let Some(map) = node.object.body.as_object_mut() else { return };
    let metadata = map.entry("metadata").or_insert_with(|| serde_json::json!({}));
    let Some(metadata) = metadata.as_object_mut() else { return };
    let owner_refs = metadata.entry("ownerReferences").or_insert_with(|| serde_json::json!([]));
    if let Some(list) = owner_refs.as_array_mut() {
        list.push(serde_json::to_value(owner_ref).expect("OwnerReference always serializes"));
    }
}
