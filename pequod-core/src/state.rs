//! Runtime state for nodes and graph executions.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum NodePhase {
    Pending,
    Applying,
    WaitingReady,
    Ready,
    Error,
}

impl NodePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodePhase::Ready | NodePhase::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum GraphPhase {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Per-node runtime record, keyed by node id on `GraphExecutionState::node_states`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct NodeRuntimeState {
    pub phase: NodePhase,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub adopted: bool,
    #[serde(default)]
    pub adopted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub previous_managers: Vec<String>,
}

impl NodeRuntimeState {
    pub fn pending() -> Self {
        Self {
            phase: NodePhase::Pending,
            message: None,
            last_error: None,
            last_transition_time: None,
            applied_at: None,
            ready_at: None,
            adopted: false,
            adopted_at: None,
            previous_managers: Vec::new(),
        }
    }

    /// Transition to a new phase, stamping `last_transition_time`.
    pub fn transition(&mut self, phase: NodePhase, now: DateTime<Utc>) {
        self.phase = phase;
        self.last_transition_time = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Snapshot of an entire graph execution, written back onto the graph record's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct GraphExecutionState {
    pub phase: GraphPhase,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub node_states: BTreeMap<String, NodeRuntimeState>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Default for GraphExecutionState {
    fn default() -> Self {
        Self::pending()
    }
}

impl GraphExecutionState {
    pub fn pending() -> Self {
        Self {
            phase: GraphPhase::Pending,
            observed_generation: 0,
            node_states: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            conditions: Vec::new(),
        }
    }

    /// Completed iff every node Ready; Failed iff any node Error
    /// and no further progress is possible; otherwise Executing.
    pub fn recompute_phase(&mut self) {
        let all_ready = self
            .node_states
            .values()
            .all(|s| s.phase == NodePhase::Ready);
        if all_ready && !self.node_states.is_empty() {
            self.phase = GraphPhase::Completed;
            return;
        }
        let any_error = self.node_states.values().any(|s| s.phase == NodePhase::Error);
        let any_in_flight = self
            .node_states
            .values()
            .any(|s| matches!(s.phase, NodePhase::Pending | NodePhase::Applying | NodePhase::WaitingReady));
        self.phase = if any_error && !any_in_flight {
            GraphPhase::Failed
        } else {
            GraphPhase::Executing
        };
    }
}
