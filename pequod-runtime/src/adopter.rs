//! Takes ownership of pre-existing objects into management using
//! server-side apply, per the adoption protocol.
use kube::{
    api::{DynamicObject, Patch, PatchParams},
    core::GroupVersionKind as KubeGvk,
    discovery::ApiResource,
    Api, Client,
};
use pequod_core::graph::{AdoptedResourceRef, AdoptionMode, AdoptionSpec, AdoptionStrategy, NodeSpec};
use thiserror::Error;
use tracing::info;

use crate::applier::managed_field_managers;

#[derive(Debug, Error)]
pub enum AdoptionError {
    #[error("adoption mode LabelSelector is not implemented")]
    NotImplemented,
    #[error("adopted resource {kind}/{name} has no matching node and does not exist in the cluster")]
    MissingResource { kind: String, name: String },
    #[error("unknown adoption strategy for {kind}/{name}")]
    UnknownStrategy { kind: String, name: String },
    #[error("malformed adopted resource type {api_version}/{kind}")]
    MalformedType { api_version: String, kind: String },
    #[error("cluster error adopting {kind}/{name}: {source}")]
    Cluster {
        kind: String,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Result of adopting a single resource.
#[derive(Debug, Clone)]
pub struct AdoptionResult {
    pub node_id: Option<String>,
    pub created: bool,
    pub already_managed: bool,
    pub previous_managers: Vec<String>,
}

/// A warning surfaced by the pre-flight safety check; none of these block adoption.
#[derive(Debug, Clone)]
pub enum PreflightWarning {
    WillBeCreated { kind: String, name: String },
    OtherManagersPresent { kind: String, name: String, managers: Vec<String> },
    HasControllingOwner { kind: String, name: String },
}

#[derive(Debug, Clone)]
pub enum PreflightError {
    MalformedType { api_version: String, kind: String },
    ListFailed { kind: String, message: String },
}

/// Find the node that supplies a desired body for an adopted resource ref:
/// by explicit `node_id` if set, otherwise by matching type/namespace/name.
fn find_matching_node<'a>(resource_ref: &AdoptedResourceRef, nodes: &'a [NodeSpec]) -> Option<&'a NodeSpec> {
    match &resource_ref.node_id {
        Some(id) => nodes.iter().find(|n| &n.id == id),
        None => nodes.iter().find(|n| {
            n.object.api_version == resource_ref.api_version
                && n.object.kind == resource_ref.kind
                && n.object.namespace == resource_ref.namespace
                && n.object.name == resource_ref.name
        }),
    }
}

pub struct Adopter {
    client: Client,
}

impl Adopter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, AdoptionError> {
        let gvk = pequod_core::gvk::GroupVersionKind::from_api_version_kind(api_version, kind).map_err(|_| {
            AdoptionError::MalformedType {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
            }
        })?;
        let kube_gvk = KubeGvk::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let resource = ApiResource::from_gvk(&kube_gvk);
        Ok(match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        })
    }

    /// Adopt every resource ref in `spec`, matching each one against
    /// `nodes` by `node_id` or by (type, namespace, name).
    pub async fn adopt_all(
        &self,
        spec: &AdoptionSpec,
        nodes: &[NodeSpec],
    ) -> Vec<(AdoptedResourceRef, Result<AdoptionResult, AdoptionError>)> {
        if spec.mode == AdoptionMode::LabelSelector {
            return spec
                .resources
                .iter()
                .cloned()
                .map(|r| (r, Err(AdoptionError::NotImplemented)))
                .collect();
        }
        let mut results = Vec::with_capacity(spec.resources.len());
        for resource_ref in &spec.resources {
            let result = self.adopt_one(resource_ref, nodes).await;
            results.push((resource_ref.clone(), result));
        }
        results
    }

    async fn adopt_one(
        &self,
        resource_ref: &AdoptedResourceRef,
        nodes: &[NodeSpec],
    ) -> Result<AdoptionResult, AdoptionError> {
        let matching_node = find_matching_node(resource_ref, nodes);

        let api = self.api_for(&resource_ref.api_version, &resource_ref.kind, resource_ref.namespace.as_deref())?;
        let existing = api.get_opt(&resource_ref.name).await.map_err(|source| AdoptionError::Cluster {
            kind: resource_ref.kind.clone(),
            name: resource_ref.name.clone(),
            source,
        })?;

        let Some(existing) = existing else {
            let Some(node) = matching_node else {
                return Err(AdoptionError::MissingResource {
                    kind: resource_ref.kind.clone(),
                    name: resource_ref.name.clone(),
                });
            };
            let mut body: DynamicObject = serde_json::from_value(node.object.body.clone()).map_err(|_| {
                AdoptionError::MalformedType {
                    api_version: resource_ref.api_version.clone(),
                    kind: resource_ref.kind.clone(),
                }
            })?;
            body.types = Some(kube::api::TypeMeta {
                api_version: resource_ref.api_version.clone(),
                kind: resource_ref.kind.clone(),
            });
            api.create(&Default::default(), &body).await.map_err(|source| AdoptionError::Cluster {
                kind: resource_ref.kind.clone(),
                name: resource_ref.name.clone(),
                source,
            })?;
            info!(kind = %resource_ref.kind, name = %resource_ref.name, "adopted resource created from node body");
            return Ok(AdoptionResult {
                node_id: matching_node.map(|n| n.id.clone()),
                created: true,
                already_managed: false,
                previous_managers: Vec::new(),
            });
        };

        let managers = managed_field_managers(&existing.metadata);
        if managers.iter().any(|m| m == pequod_core::graph::DEFAULT_FIELD_MANAGER) {
            return Ok(AdoptionResult {
                node_id: matching_node.map(|n| n.id.clone()),
                created: false,
                already_managed: true,
                previous_managers: managers,
            });
        }

        match resource_ref.strategy {
            AdoptionStrategy::Mirror => Ok(AdoptionResult {
                node_id: matching_node.map(|n| n.id.clone()),
                created: false,
                already_managed: false,
                previous_managers: managers,
            }),
            AdoptionStrategy::TakeOwnership => {
                let body = match matching_node {
                    Some(node) => serde_json::from_value(node.object.body.clone()).map_err(|_| {
                        AdoptionError::MalformedType {
                            api_version: resource_ref.api_version.clone(),
                            kind: resource_ref.kind.clone(),
                        }
                    })?,
                    None => existing.clone(),
                };
                let params = PatchParams::apply(pequod_core::graph::DEFAULT_FIELD_MANAGER).force();
                api.patch(&resource_ref.name, &params, &Patch::Apply(&body))
                    .await
                    .map_err(|source| AdoptionError::Cluster {
                        kind: resource_ref.kind.clone(),
                        name: resource_ref.name.clone(),
                        source,
                    })?;
                info!(kind = %resource_ref.kind, name = %resource_ref.name, "took ownership via server-side apply");
                Ok(AdoptionResult {
                    node_id: matching_node.map(|n| n.id.clone()),
                    created: false,
                    already_managed: false,
                    previous_managers: managers,
                })
            }
        }
    }

    /// Enumerate warnings and blocking errors for an adoption spec without
    /// mutating anything.
    pub async fn preflight(
        &self,
        spec: &AdoptionSpec,
        nodes: &[NodeSpec],
    ) -> (Vec<PreflightWarning>, Vec<PreflightError>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        for resource_ref in &spec.resources {
            let api = match self.api_for(&resource_ref.api_version, &resource_ref.kind, resource_ref.namespace.as_deref()) {
                Ok(api) => api,
                Err(_) => {
                    errors.push(PreflightError::MalformedType {
                        api_version: resource_ref.api_version.clone(),
                        kind: resource_ref.kind.clone(),
                    });
                    continue;
                }
            };
            match api.get_opt(&resource_ref.name).await {
                Ok(None) => {
                    let has_node = nodes.iter().any(|n| resource_ref.node_id.as_deref() == Some(n.id.as_str()));
                    if has_node {
                        warnings.push(PreflightWarning::WillBeCreated {
                            kind: resource_ref.kind.clone(),
                            name: resource_ref.name.clone(),
                        });
                    } else {
                        errors.push(PreflightError::ListFailed {
                            kind: resource_ref.kind.clone(),
                            message: "resource missing and no node supplies a body".to_string(),
                        });
                    }
                }
                Ok(Some(obj)) => {
                    let managers = managed_field_managers(&obj.metadata);
                    let other_managers: Vec<String> =
                        managers.into_iter().filter(|m| m != pequod_core::graph::DEFAULT_FIELD_MANAGER).collect();
                    if !other_managers.is_empty() {
                        warnings.push(PreflightWarning::OtherManagersPresent {
                            kind: resource_ref.kind.clone(),
                            name: resource_ref.name.clone(),
                            managers: other_managers,
                        });
                    }
                    if obj.metadata.owner_references.iter().flatten().any(|o| o.controller == Some(true)) {
                        warnings.push(PreflightWarning::HasControllingOwner {
                            kind: resource_ref.kind.clone(),
                            name: resource_ref.name.clone(),
                        });
                    }
                }
                Err(source) => errors.push(PreflightError::ListFailed {
                    kind: resource_ref.kind.clone(),
                    message: source.to_string(),
                }),
            }
        }
        (warnings, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pequod_core::graph::{ApplyPolicy, NodeObject};
    use serde_json::json;

    fn node(id: &str, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            object: NodeObject {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                namespace: namespace.map(str::to_string),
                name: name.to_string(),
                body: json!({}),
            },
            apply_policy: ApplyPolicy::default(),
            depends_on: Default::default(),
            ready_when: Vec::new(),
        }
    }

    fn resource_ref(node_id: Option<&str>, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> AdoptedResourceRef {
        AdoptedResourceRef {
            node_id: node_id.map(str::to_string),
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
            strategy: AdoptionStrategy::TakeOwnership,
        }
    }

    #[test]
    fn matches_by_explicit_node_id() {
        let nodes = vec![node("cfg", "v1", "ConfigMap", Some("default"), "cfg")];
        let resource = resource_ref(Some("cfg"), "v1", "ConfigMap", Some("default"), "cfg");
        assert_eq!(find_matching_node(&resource, &nodes).map(|n| n.id.as_str()), Some("cfg"));
    }

    #[test]
    fn falls_back_to_type_namespace_name_when_node_id_is_absent() {
        let nodes = vec![node("other", "v1", "ConfigMap", Some("default"), "cfg")];
        let resource = resource_ref(None, "v1", "ConfigMap", Some("default"), "cfg");
        assert_eq!(find_matching_node(&resource, &nodes).map(|n| n.id.as_str()), Some("other"));
    }

    #[test]
    fn no_match_when_nothing_lines_up() {
        let nodes = vec![node("cfg", "v1", "ConfigMap", Some("default"), "cfg")];
        let resource = resource_ref(None, "v1", "ConfigMap", Some("kube-system"), "cfg");
        assert!(find_matching_node(&resource, &nodes).is_none());
    }
}
