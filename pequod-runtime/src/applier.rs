//! Executes a single node's apply/create/adopt against the cluster and
//! classifies field-manager conflicts.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{DynamicObject, Patch, PatchParams, PostParams},
    core::{ErrorResponse, GroupVersionKind as KubeGvk},
    discovery::ApiResource,
    Api, Client,
};
use pequod_core::{
    gvk::{GroupVersionKind, ObjectIdentity},
    graph::{ApplyMode, ApplyPolicy, ConflictPolicy, NodeObject},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("field manager conflict applying {identity} with manager {field_manager:?}")]
    Conflict {
        identity: ObjectIdentity,
        field_manager: String,
        #[source]
        source: kube::Error,
    },
    #[error("cluster error applying {identity}: {source}")]
    Cluster {
        identity: ObjectIdentity,
        #[source]
        source: kube::Error,
    },
}

/// Outcome of a single apply call, independent of whether the error path was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The object was created or patched.
    Applied,
    /// Mode=Create and the object already existed; treated as success.
    AlreadyExists,
}

fn api_for(client: Client, gvk: &GroupVersionKind, namespace: Option<&str>) -> Api<DynamicObject> {
    let kube_gvk = KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind);
    let resource = ApiResource::from_gvk(&kube_gvk);
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    }
}

fn dynamic_object(object: &NodeObject) -> Result<DynamicObject, serde_json::Error> {
    let mut value = object.body.clone();
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), object.api_version.clone().into());
        map.insert("kind".into(), object.kind.clone().into());
    }
    serde_json::from_value(value)
}

/// Apply, create or adopt a single node's object, per the mode in its
/// [`ApplyPolicy`].
pub struct Applier {
    client: Client,
    metrics: Option<Arc<Metrics>>,
}

fn mode_label(mode: ApplyMode) -> &'static str {
    match mode {
        ApplyMode::Apply => "apply",
        ApplyMode::Create => "create",
        ApplyMode::Adopt => "adopt",
    }
}

impl Applier {
    pub fn new(client: Client) -> Self {
        Self { client, metrics: None }
    }

    /// Attach a metrics sink so every apply records `pequod_apply_operations_total`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self, object), fields(node.id = %identity, mode = ?policy.mode))]
    pub async fn apply(
        &self,
        identity: &ObjectIdentity,
        object: &NodeObject,
        policy: &ApplyPolicy,
    ) -> Result<ApplyOutcome, ApplyError> {
        let result = self.apply_inner(identity, object, policy, false).await;
        if let Some(metrics) = &self.metrics {
            let result_label = if result.is_ok() { "success" } else { "error" };
            metrics
                .apply_operations_total
                .with_label_values(&[mode_label(policy.mode), result_label])
                .inc();
        }
        result
    }

    /// Same as [`Applier::apply`] but performs the same server interaction
    /// without persisting the result, per the dry-run requirement.
    pub async fn apply_dry_run(
        &self,
        identity: &ObjectIdentity,
        object: &NodeObject,
        policy: &ApplyPolicy,
    ) -> Result<ApplyOutcome, ApplyError> {
        self.apply_inner(identity, object, policy, true).await
    }

    async fn apply_inner(
        &self,
        identity: &ObjectIdentity,
        object: &NodeObject,
        policy: &ApplyPolicy,
        dry_run: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        let api = api_for(self.client.clone(), &identity.gvk, identity.namespace.as_deref());
        let body = dynamic_object(object).map_err(|source| ApplyError::Cluster {
            identity: identity.clone(),
            source: kube::Error::SerdeError(source),
        })?;

        match policy.mode {
            ApplyMode::Create => self.create_only(&api, identity, body, dry_run).await,
            ApplyMode::Apply => {
                self.server_side_apply(&api, identity, body, &policy.field_manager, policy.conflict_policy, dry_run)
                    .await
            }
            ApplyMode::Adopt => self.adopt_apply(&api, identity, body, &policy.field_manager, dry_run).await,
        }
    }

    async fn create_only(
        &self,
        api: &Api<DynamicObject>,
        identity: &ObjectIdentity,
        body: DynamicObject,
        dry_run: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        let params = if dry_run { PostParams { dry_run: true, field_manager: None } } else { PostParams::default() };
        match api.create(&params, &body).await {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => {
                info!(identity = %identity, "object already exists, Create mode treats this as success");
                Ok(ApplyOutcome::AlreadyExists)
            }
            Err(source) => Err(ApplyError::Cluster { identity: identity.clone(), source }),
        }
    }

    async fn server_side_apply(
        &self,
        api: &Api<DynamicObject>,
        identity: &ObjectIdentity,
        body: DynamicObject,
        field_manager: &str,
        conflict_policy: ConflictPolicy,
        dry_run: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        let mut params = PatchParams::apply(field_manager);
        if conflict_policy == ConflictPolicy::Force {
            params = params.force();
        }
        params.dry_run = dry_run;
        match api.patch(&identity.name, &params, &Patch::Apply(&body)).await {
            Ok(_) => Ok(ApplyOutcome::Applied),
            Err(source @ kube::Error::Api(ErrorResponse { code: 409, .. })) => {
                warn!(identity = %identity, field_manager, "field manager conflict");
                Err(ApplyError::Conflict {
                    identity: identity.clone(),
                    field_manager: field_manager.to_string(),
                    source,
                })
            }
            Err(source) => Err(ApplyError::Cluster { identity: identity.clone(), source }),
        }
    }

    async fn adopt_apply(
        &self,
        api: &Api<DynamicObject>,
        identity: &ObjectIdentity,
        body: DynamicObject,
        field_manager: &str,
        dry_run: bool,
    ) -> Result<ApplyOutcome, ApplyError> {
        match api.get_opt(&identity.name).await {
            Ok(None) => self.create_only(api, identity, body, dry_run).await,
            Ok(Some(_)) => {
                let mut params = PatchParams::apply(field_manager).force();
                params.dry_run = dry_run;
                api.patch(&identity.name, &params, &Patch::Apply(&body))
                    .await
                    .map(|_| ApplyOutcome::Applied)
                    .map_err(|source| ApplyError::Cluster { identity: identity.clone(), source })
            }
            Err(source) => Err(ApplyError::Cluster { identity: identity.clone(), source }),
        }
    }
}

/// The distinct field-manager names recorded on an object's server-side-apply
/// metadata, used by the adopter to detect prior ownership.
pub fn managed_field_managers(meta: &ObjectMeta) -> Vec<String> {
    let mut managers: Vec<String> = meta
        .managed_fields
        .iter()
        .flatten()
        .filter_map(|mf| mf.manager.clone())
        .collect();
    managers.sort();
    managers.dedup();
    managers
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ManagedFieldsEntry;

    fn meta_with_managers(names: &[&str]) -> ObjectMeta {
        ObjectMeta {
            managed_fields: Some(
                names
                    .iter()
                    .map(|name| ManagedFieldsEntry { manager: Some(name.to_string()), ..Default::default() })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn lists_distinct_managers_sorted() {
        let meta = meta_with_managers(&["kubectl-client-side-apply", "pequod-operator", "kubectl-client-side-apply"]);
        assert_eq!(managed_field_managers(&meta), vec!["kubectl-client-side-apply", "pequod-operator"]);
    }

    #[test]
    fn empty_when_no_managed_fields() {
        assert!(managed_field_managers(&ObjectMeta::default()).is_empty());
    }
}
