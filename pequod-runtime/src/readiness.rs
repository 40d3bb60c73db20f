//! Evaluates a node's readiness predicates against live cluster state.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as K8sCondition;
use kube::{core::GroupVersionKind as KubeGvk, discovery::ApiResource, Api, Client};
use pequod_core::{gvk::ObjectIdentity, graph::ReadinessPredicate};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error("failed to read {identity} while checking readiness: {source}")]
    Cluster {
        identity: ObjectIdentity,
        #[source]
        source: kube::Error,
    },
}

/// Why a node is not yet ready, naming the predicate that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotReady {
    pub reason: String,
}

#[derive(Debug)]
pub enum Readiness {
    Ready,
    NotReady(NotReady),
}

fn api_for(client: Client, identity: &ObjectIdentity) -> Api<kube::api::DynamicObject> {
    let kube_gvk = KubeGvk::gvk(&identity.gvk.group, &identity.gvk.version, &identity.gvk.kind);
    let resource = ApiResource::from_gvk(&kube_gvk);
    match identity.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    }
}

/// Reads the object's `status.conditions` (the shape the vast majority of
/// controllers agree on) and looks for an entry whose `type` and `status` match.
fn condition_matches(body: &serde_json::Value, condition_type: &str, expected_status: &str) -> bool {
    let Some(conditions) = body.pointer("/status/conditions") else {
        return false;
    };
    let Ok(conditions) = serde_json::from_value::<Vec<K8sCondition>>(conditions.clone()) else {
        return false;
    };
    conditions
        .iter()
        .any(|c| c.type_ == condition_type && c.status == expected_status)
}

pub struct ReadinessChecker {
    client: Client,
}

impl ReadinessChecker {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The first predicate that is not satisfied causes `NotReady`. An empty
    /// list means ready immediately.
    pub async fn is_ready(
        &self,
        identity: &ObjectIdentity,
        predicates: &[ReadinessPredicate],
    ) -> Result<Readiness, ReadinessError> {
        if predicates.is_empty() {
            return Ok(Readiness::Ready);
        }
        let api = api_for(self.client.clone(), identity);
        let object = api
            .get_opt(&identity.name)
            .await
            .map_err(|source| ReadinessError::Cluster { identity: identity.clone(), source })?;

        for predicate in predicates {
            let satisfied = match predicate {
                ReadinessPredicate::Exists => object.is_some(),
                ReadinessPredicate::ConditionMatch { condition_type, expected_status } => object
                    .as_ref()
                    .map(|obj| condition_matches(&obj.data, condition_type, expected_status))
                    .unwrap_or(false),
                ReadinessPredicate::DeploymentAvailable => object
                    .as_ref()
                    .map(|obj| condition_matches(&obj.data, "Available", "True"))
                    .unwrap_or(false),
            };
            if !satisfied {
                return Ok(Readiness::NotReady(NotReady {
                    reason: reason_for(predicate),
                }));
            }
        }
        Ok(Readiness::Ready)
    }
}

fn reason_for(predicate: &ReadinessPredicate) -> String {
    match predicate {
        ReadinessPredicate::Exists => "object does not exist".to_string(),
        ReadinessPredicate::ConditionMatch { condition_type, expected_status } => {
            format!("condition {condition_type}={expected_status} not observed")
        }
        ReadinessPredicate::DeploymentAvailable => "condition Available=True not observed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_matches_true_when_type_and_status_agree() {
        let body = json!({
            "status": { "conditions": [
                {"type": "Available", "status": "True", "lastTransitionTime": "2024-01-01T00:00:00Z"},
            ]}
        });
        assert!(condition_matches(&body, "Available", "True"));
    }

    #[test]
    fn condition_matches_false_when_status_disagrees() {
        let body = json!({
            "status": { "conditions": [
                {"type": "Available", "status": "False", "lastTransitionTime": "2024-01-01T00:00:00Z"},
            ]}
        });
        assert!(!condition_matches(&body, "Available", "True"));
    }

    #[test]
    fn condition_matches_false_when_conditions_absent() {
        let body = json!({"status": {}});
        assert!(!condition_matches(&body, "Available", "True"));
    }
}
