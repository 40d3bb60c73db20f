//! Per-instance control loop: identify the instance's published type, find
//! the platform definition that published it, render a graph, and keep the
//! corresponding graph record in sync.
use std::sync::Arc;

use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    core::{ErrorResponse, GroupVersionKind as KubeGvk},
    discovery::ApiResource,
    runtime::controller::Action as KubeAction,
    Client, Resource, ResourceExt,
};
use pequod_core::{
    gvk::GroupVersionKind,
    hash::ContentHash,
    graph::{DEFAULT_FIELD_MANAGER, SourceRef},
};
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::{
    collaborators::{RenderError, Renderer},
    dynamic_watcher::DynamicTypeWatcher,
    resources::{GraphRecordSpec, Instance, InstanceSpec},
};

#[derive(Debug, Error)]
pub enum InstanceReconcileError {
    #[error("instance {0:?} has no name")]
    UnnamedObject(String),
    #[error("instance's published type is not yet known to the watcher")]
    UnknownType,
    #[error("no platform definition is registered for this instance's type")]
    UnknownPlatform,
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("cluster error: {source}")]
    Cluster {
        #[source]
        source: kube::Error,
    },
}

pub struct InstanceReconcilerContext {
    pub client: Client,
    pub watcher: Arc<DynamicTypeWatcher>,
    pub renderer: Arc<dyn Renderer>,
    pub requeue_interval: std::time::Duration,
}

pub fn error_policy(_obj: Arc<DynamicObject>, err: &InstanceReconcileError, ctx: Arc<InstanceReconcilerContext>) -> KubeAction {
    warn!(error = %err, "instance reconcile failed, retrying");
    KubeAction::requeue(ctx.requeue_interval)
}

#[instrument(skip(obj, ctx), fields(instance = %obj.name_any()))]
pub async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<InstanceReconcilerContext>) -> Result<KubeAction, InstanceReconcileError> {
    let name = obj.meta().name.clone().ok_or_else(|| InstanceReconcileError::UnnamedObject(format!("{obj:?}")))?;
    let namespace = obj.meta().namespace.clone();

    if obj.meta().deletion_timestamp.is_some() {
        // The graph record carries an owner reference back to this instance;
        // Kubernetes garbage collection removes it, cascading to every node.
        return Ok(KubeAction::await_change());
    }

    let key = (namespace.clone(), name.clone());
    let gvk = match ctx.watcher.resolve_instance_type(&key) {
        Some(gvk) => gvk,
        None => {
            let gvk = obj
                .types
                .as_ref()
                .map(|t| GroupVersionKind::from_api_version_kind(&t.api_version, &t.kind))
                .transpose()
                .ok()
                .flatten()
                .ok_or(InstanceReconcileError::UnknownType)?;
            ctx.watcher.index_instance(key, gvk.clone());
            gvk
        }
    };

    let platform = ctx.watcher.platform_for(&gvk).ok_or(InstanceReconcileError::UnknownPlatform)?;

    let instance = to_instance(&obj);
    let contents = ctx.renderer.render(&instance, &platform.module_ref).await?;

    let render_payload = json!({ "metadata": contents.metadata, "nodes": contents.nodes });
    let render_hash = ContentHash::of_object(&render_payload);
    let graph_name = format!("{name}-{}", &render_hash.as_str()[7..15.min(render_hash.as_str().len())]);

    let instance_resource = ApiResource::from_gvk(&KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind));

    let graph_api: Api<kube::api::DynamicObject> = graph_record_api(ctx.client.clone(), namespace.as_deref());
    let owner_ref = obj.controller_owner_ref(&instance_resource);
    let graph_spec = serde_json::to_value(GraphRecordSpec {
        source_ref: SourceRef {
            api_version: gvk.api_version(),
            kind: gvk.kind.clone(),
            name: name.clone(),
            namespace: namespace.clone(),
            uid: obj.meta().uid.clone().unwrap_or_default(),
        },
        metadata: contents.metadata,
        nodes: contents.nodes,
        violations: contents.violations,
        adopt: contents.adopt,
        render_hash: render_hash.to_string(),
        rendered_at: chrono::Utc::now(),
    })
    .expect("GraphRecordSpec always serializes");

    let mut body = json!({
        "apiVersion": "pequod.io/v1alpha1",
        "kind": "GraphRecord",
        "metadata": { "name": graph_name, "namespace": namespace },
        "spec": graph_spec,
    });
    if let Some(owner_ref) = &owner_ref {
        body["metadata"]["ownerReferences"] = json!([owner_ref]);
    }
    let graph_object: kube::api::DynamicObject = serde_json::from_value(body).expect("well-formed GraphRecord document");

    let params = PatchParams::apply(DEFAULT_FIELD_MANAGER).force();
    graph_api
        .patch(&graph_name, &params, &Patch::Apply(&graph_object))
        .await
        .map_err(|source| InstanceReconcileError::Cluster { source })?;

    info!(graph = %graph_name, "instance rendered");

    let instance_api: Api<DynamicObject> = match &namespace {
        Some(ns) => Api::namespaced_with(ctx.client.clone(), ns, &instance_resource),
        None => Api::all_with(ctx.client.clone(), &instance_resource),
    };
    let status_patch = json!({ "status": { "graphRef": graph_name } });
    match instance_api
        .patch_status(&name, &PatchParams::apply(DEFAULT_FIELD_MANAGER).force(), &Patch::Merge(status_patch))
        .await
    {
        Ok(_) => {}
        Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {}
        Err(source) => return Err(InstanceReconcileError::Cluster { source }),
    }

    Ok(KubeAction::await_change())
}

fn graph_record_api(client: Client, namespace: Option<&str>) -> Api<kube::api::DynamicObject> {
    let kube_gvk = KubeGvk::gvk("pequod.io", "v1alpha1", "GraphRecord");
    let resource = ApiResource::from_gvk(&kube_gvk);
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    }
}

fn to_instance(obj: &DynamicObject) -> Instance {
    let fields = obj.data.get("spec").and_then(|v| v.as_object()).cloned().unwrap_or_default();
    Instance {
        metadata: obj.metadata.clone(),
        spec: InstanceSpec { fields },
        status: obj
            .data
            .get("status")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
    }
}
