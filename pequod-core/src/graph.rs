//! The rendered graph record: the immutable input to the execution engine.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Maximum number of nodes a single rendered graph may contain.
pub const MAX_NODES: usize = 100;

/// Default field manager used for server-side apply when a node doesn't override it.
pub const DEFAULT_FIELD_MANAGER: &str = "pequod-operator";

/// Reference to the instance that caused a graph to be rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub uid: String,
}

/// Identity of the rendered graph itself, independent of its owning instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GraphMetadata {
    pub name: String,
    pub version: String,
    pub platform_ref: String,
}

/// A Kubernetes object carried verbatim inside a node, never interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct NodeObject {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    /// Full object body, including `metadata`/`spec`/etc., preserved verbatim.
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ApplyMode {
    Apply,
    Create,
    Adopt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ConflictPolicy {
    Error,
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ApplyPolicy {
    pub mode: ApplyMode,
    pub conflict_policy: ConflictPolicy,
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

fn default_field_manager() -> String {
    DEFAULT_FIELD_MANAGER.to_string()
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Apply,
            conflict_policy: ConflictPolicy::Error,
            field_manager: default_field_manager(),
        }
    }
}

/// A single readiness predicate. The first unmatched predicate in a
/// node's `ready_when` list causes the node to stay `WaitingReady`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(tag = "type")]
pub enum ReadinessPredicate {
    Exists,
    ConditionMatch {
        #[serde(rename = "conditionType")]
        condition_type: String,
        #[serde(rename = "expectedStatus")]
        expected_status: String,
    },
    DeploymentAvailable,
}

/// A single node in the dependency DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct NodeSpec {
    pub id: String,
    pub object: NodeObject,
    pub apply_policy: ApplyPolicy,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub ready_when: Vec<ReadinessPredicate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum AdoptionMode {
    Explicit,
    LabelSelector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum AdoptionStrategy {
    TakeOwnership,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AdoptedResourceRef {
    /// If set, the node supplying the desired body for this adoption.
    #[serde(default)]
    pub node_id: Option<String>,
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub strategy: AdoptionStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct AdoptionSpec {
    pub mode: AdoptionMode,
    #[serde(default)]
    pub resources: Vec<AdoptedResourceRef>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PolicyViolation {
    pub path: String,
    pub message: String,
    pub severity: Severity,
}

/// True if any recorded policy violation is severe enough to block
/// execution, at the reconciler's discretion.
pub fn has_blocking_violations(violations: &[PolicyViolation]) -> bool {
    violations.iter().any(|v| v.severity == Severity::Error)
}
