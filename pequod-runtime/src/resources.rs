//! The three record kinds the engine reads and writes: platform definitions,
//! instances, and graph records. Spec/status split the way `kube::derive`
//! expects so `kube::runtime::Controller` can watch each of them directly.
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition as K8sCondition;
use kube::CustomResource;
use pequod_core::{
    graph::{AdoptionSpec, GraphMetadata, NodeSpec, PolicyViolation, SourceRef},
    state::GraphExecutionState,
    InventoryItem,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A platform engineer's registration of a templating module and the
/// user-facing type it publishes.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pequod.io",
    version = "v1alpha1",
    kind = "PlatformDefinition",
    plural = "platformdefinitions",
    shortname = "platdef",
    status = "PlatformDefinitionStatus",
    namespaced
)]
pub struct PlatformDefinitionSpec {
    /// Reference to the module the renderer should load (OCI/Git/ConfigMap/inline).
    pub module_ref: String,
    /// Group/version/kind this definition publishes for developers to instantiate.
    pub publishes: PublishedType,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PublishedType {
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PlatformDefinitionStatus {
    /// Set once the published type's CRD is established on the cluster, in
    /// `group/version/Kind` wire form; read by the dynamic-type watcher.
    #[serde(default)]
    pub published_type: Option<String>,
    #[serde(default)]
    pub conditions: Vec<K8sCondition>,
}

/// A user-facing instance of a published type. `spec`/`status` beyond
/// `graph_ref` are platform-defined and opaque to the engine, so they're
/// carried as a raw JSON value rather than a concrete Rust type.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pequod.io",
    version = "v1alpha1",
    kind = "Instance",
    plural = "instances",
    status = "InstanceStatus",
    namespaced
)]
pub struct InstanceSpec {
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct InstanceStatus {
    /// The graph record rendered for this instance, if any.
    #[serde(default)]
    pub graph_ref: Option<String>,
    #[serde(default)]
    pub conditions: Vec<K8sCondition>,
    /// Durable copy of this instance's inventory, mirroring the in-memory
    /// tracker so it survives an operator restart.
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
}

/// The engine-owned record of a rendered graph plus its execution status.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "pequod.io",
    version = "v1alpha1",
    kind = "GraphRecord",
    plural = "graphrecords",
    status = "GraphRecordStatus",
    namespaced
)]
pub struct GraphRecordSpec {
    pub source_ref: SourceRef,
    pub metadata: GraphMetadata,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub violations: Vec<PolicyViolation>,
    #[serde(default)]
    pub adopt: Option<AdoptionSpec>,
    pub render_hash: String,
    pub rendered_at: chrono::DateTime<chrono::Utc>,
}

pub type GraphRecordStatus = GraphExecutionState;
