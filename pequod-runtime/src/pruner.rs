//! Deletes or orphans tracked objects no longer present in the graph,
//! honoring protection annotations and grace periods.
use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::{
    api::{DeleteParams, DynamicObject, Preconditions, PropagationPolicy},
    core::GroupVersionKind as KubeGvk,
    discovery::ApiResource,
    Api, Client,
};
use pequod_core::{gvk::ObjectIdentity, InventoryStatus};
use thiserror::Error;
use tracing::info;

use crate::inventory::InventoryTracker;

pub const PROTECTION_ANNOTATION: &str = "pequod.io/prune-protection";
pub const GRACE_PERIOD_ANNOTATION: &str = "pequod.io/prune-grace-period";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionPolicy {
    Delete,
    Orphan,
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub deletion_policy: DeletionPolicy,
    pub grace_period: ChronoDuration,
    pub dry_run: bool,
    pub propagation_policy: PropagationPolicy,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self {
            deletion_policy: DeletionPolicy::Delete,
            grace_period: ChronoDuration::zero(),
            dry_run: false,
            propagation_policy: PropagationPolicy::Background,
        }
    }
}

#[derive(Debug, Error)]
pub enum PruneError {
    #[error("cluster error pruning {identity}: {source}")]
    Cluster {
        identity: ObjectIdentity,
        #[source]
        source: kube::Error,
    },
}

/// The disposition of a single inventory item after one prune pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneDisposition {
    Pruned,
    Protected,
    WithinGracePeriod,
    AlreadyAbsent,
    Orphaned,
}

#[derive(Debug, Clone)]
pub struct PruneReportEntry {
    pub id: String,
    pub identity: ObjectIdentity,
    pub disposition: PruneDisposition,
}

fn api_for(client: Client, identity: &ObjectIdentity) -> Api<DynamicObject> {
    let kube_gvk = KubeGvk::gvk(&identity.gvk.group, &identity.gvk.version, &identity.gvk.kind);
    let resource = ApiResource::from_gvk(&kube_gvk);
    match identity.namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &resource),
        None => Api::all_with(client, &resource),
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "yes" | "1")
}

fn effective_grace_period(object: &DynamicObject, default_grace: ChronoDuration) -> ChronoDuration {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GRACE_PERIOD_ANNOTATION))
        .and_then(|v| humantime::parse_duration(v).ok())
        .and_then(|d| ChronoDuration::from_std(d).ok())
        .unwrap_or(default_grace)
}

fn is_protected(object: &DynamicObject) -> bool {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(PROTECTION_ANNOTATION))
        .map(|v| truthy(v))
        .unwrap_or(false)
}

/// What to do with one still-existing inventory item, decided without
/// touching the cluster so the decision itself is unit-testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Protected,
    WithinGracePeriod,
    Delete,
    Orphan,
}

fn decide(existing: &DynamicObject, policy: DeletionPolicy, default_grace: ChronoDuration, now: DateTime<Utc>) -> Decision {
    if is_protected(existing) {
        return Decision::Protected;
    }
    let grace = effective_grace_period(existing, default_grace);
    let created_at = existing.metadata.creation_timestamp.as_ref().map(|t| t.0).unwrap_or(now);
    if now - created_at < grace {
        return Decision::WithinGracePeriod;
    }
    match policy {
        DeletionPolicy::Delete => Decision::Delete,
        DeletionPolicy::Orphan => Decision::Orphan,
    }
}

pub struct Pruner {
    client: Client,
}

impl Pruner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Run one prune pass over every inventory item not present in `current_ids`.
    pub async fn prune(
        &self,
        tracker: &InventoryTracker,
        current_ids: &BTreeSet<String>,
        options: &PruneOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<PruneReportEntry>, PruneError> {
        let orphaned_ids = tracker.orphaned_ids(current_ids);
        for id in &orphaned_ids {
            tracker.set_status(id, InventoryStatus::Orphaned);
        }
        self.prune_by_ids(tracker, &orphaned_ids, options, now).await
    }

    /// Prune a specific set of inventory ids, independent of whether they're
    /// currently absent from a graph (used by the orphan-prune path and by
    /// direct operator intervention).
    pub async fn prune_by_ids(
        &self,
        tracker: &InventoryTracker,
        ids: &[String],
        options: &PruneOptions,
        now: DateTime<Utc>,
    ) -> Result<Vec<PruneReportEntry>, PruneError> {
        let mut report = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(item) = tracker.get(id) else { continue };
            let identity = item.identity.clone();
            let api = api_for(self.client.clone(), &identity);
            let existing = api.get_opt(&identity.name).await.map_err(|source| PruneError::Cluster {
                identity: identity.clone(),
                source,
            })?;

            let Some(existing) = existing else {
                tracker.remove(id);
                report.push(PruneReportEntry { id: id.clone(), identity, disposition: PruneDisposition::AlreadyAbsent });
                continue;
            };

            match decide(&existing, options.deletion_policy, options.grace_period, now) {
                Decision::Protected => {
                    report.push(PruneReportEntry { id: id.clone(), identity, disposition: PruneDisposition::Protected });
                }
                Decision::WithinGracePeriod => {
                    report.push(PruneReportEntry { id: id.clone(), identity, disposition: PruneDisposition::WithinGracePeriod });
                }
                Decision::Delete => {
                    if !options.dry_run {
                        let params = DeleteParams {
                            dry_run: false,
                            grace_period_seconds: None,
                            propagation_policy: Some(options.propagation_policy.clone()),
                            preconditions: None::<Preconditions>,
                        };
                        api.delete(&identity.name, &params).await.map_err(|source| PruneError::Cluster {
                            identity: identity.clone(),
                            source,
                        })?;
                    }
                    info!(identity = %identity, dry_run = options.dry_run, "pruned orphaned object");
                    tracker.set_status(id, InventoryStatus::Pruned);
                    report.push(PruneReportEntry { id: id.clone(), identity, disposition: PruneDisposition::Pruned });
                }
                Decision::Orphan => {
                    tracker.remove(id);
                    report.push(PruneReportEntry { id: id.clone(), identity, disposition: PruneDisposition::Orphaned });
                }
            }
        }
        Ok(report)
    }

    /// Drop inventory items already in `Orphaned`/`Pruned` status.
    pub fn cleanup_orphaned(&self, tracker: &InventoryTracker) -> usize {
        tracker.cleanup_orphaned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn truthy_accepts_common_spellings() {
        assert!(truthy("true"));
        assert!(truthy("Yes"));
        assert!(truthy("1"));
        assert!(!truthy("false"));
        assert!(!truthy(""));
    }

    fn object_with_annotations(annotations: BTreeMap<String, String>) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta { name: Some("old".into()), annotations: Some(annotations), ..Default::default() },
            data: serde_json::Value::Null,
        }
    }

    #[test]
    fn unprotected_past_grace_period_is_deleted() {
        let object = object_with_annotations(BTreeMap::new());
        let decision = decide(&object, DeletionPolicy::Delete, ChronoDuration::zero(), Utc::now());
        assert_eq!(decision, Decision::Delete);
    }

    #[test]
    fn protection_annotation_overrides_deletion_policy() {
        let object = object_with_annotations(BTreeMap::from([(PROTECTION_ANNOTATION.to_string(), "true".to_string())]));
        let decision = decide(&object, DeletionPolicy::Delete, ChronoDuration::zero(), Utc::now());
        assert_eq!(decision, Decision::Protected);
    }

    #[test]
    fn protection_is_independent_of_deletion_policy() {
        let object = object_with_annotations(BTreeMap::from([(PROTECTION_ANNOTATION.to_string(), "yes".to_string())]));
        assert_eq!(decide(&object, DeletionPolicy::Orphan, ChronoDuration::zero(), Utc::now()), Decision::Protected);
    }

    #[test]
    fn orphan_policy_without_protection_orphans() {
        let object = object_with_annotations(BTreeMap::new());
        let decision = decide(&object, DeletionPolicy::Orphan, ChronoDuration::zero(), Utc::now());
        assert_eq!(decision, Decision::Orphan);
    }

    #[test]
    fn recently_created_object_stays_within_grace_period() {
        let mut object = object_with_annotations(BTreeMap::new());
        let now = Utc::now();
        object.metadata.creation_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now));
        let decision = decide(&object, DeletionPolicy::Delete, ChronoDuration::minutes(5), now);
        assert_eq!(decision, Decision::WithinGracePeriod);
    }

    #[test]
    fn per_object_grace_period_annotation_overrides_the_default() {
        let mut object =
            object_with_annotations(BTreeMap::from([(GRACE_PERIOD_ANNOTATION.to_string(), "1h".to_string())]));
        let now = Utc::now();
        object.metadata.creation_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(now - ChronoDuration::minutes(30)));
        let decision = decide(&object, DeletionPolicy::Delete, ChronoDuration::zero(), now);
        assert_eq!(decision, Decision::WithinGracePeriod);
    }
}
