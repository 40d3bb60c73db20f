//! End-to-end exercise of the DAG builder and executor against fake cluster
//! backends, independent of any real `kube::Client`.
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pequod_core::{
    graph::{ApplyMode, ApplyPolicy, ConflictPolicy, NodeObject, NodeSpec, ReadinessPredicate},
    gvk::ObjectIdentity,
};
use pequod_runtime::{
    applier::{ApplyError, ApplyOutcome},
    dag::{ApplyBackend, BuildError, Dag, ExecutionOutcome, Executor, ExecutorConfig, ReadinessBackend},
    readiness::{Readiness, ReadinessError},
};
use tokio_util::sync::CancellationToken;

/// Records every apply call in order and always succeeds.
#[derive(Default)]
struct FakeCluster {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ApplyBackend for FakeCluster {
    async fn apply(&self, identity: &ObjectIdentity, _object: &NodeObject, _policy: &ApplyPolicy) -> Result<ApplyOutcome, ApplyError> {
        self.applied.lock().unwrap().push(identity.name.clone());
        Ok(ApplyOutcome::Applied)
    }
}

#[async_trait]
impl ReadinessBackend for FakeCluster {
    async fn is_ready(&self, _identity: &ObjectIdentity, predicates: &[ReadinessPredicate]) -> Result<Readiness, ReadinessError> {
        let _ = predicates;
        Ok(Readiness::Ready)
    }
}

fn deployment_node(id: &str, depends_on: &[&str]) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        object: NodeObject {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            namespace: Some("default".into()),
            name: id.to_string(),
            body: serde_json::json!({
                "metadata": {"name": id},
                "spec": {
                    "replicas": 1,
                    "template": {"spec": {"containers": [{"name": "nginx", "image": "nginx:latest"}]}},
                },
            }),
        },
        apply_policy: ApplyPolicy { mode: ApplyMode::Apply, conflict_policy: ConflictPolicy::Error, ..ApplyPolicy::default() },
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        ready_when: vec![ReadinessPredicate::Exists],
    }
}

#[tokio::test]
async fn single_deployment_reaches_ready() {
    let dag = Dag::build(vec![deployment_node("deployment", &[])]).unwrap();
    let cluster = Arc::new(FakeCluster::default());
    let executor = Executor::new(cluster.clone(), cluster.clone(), ExecutorConfig::default());

    let (outcome, state) = executor.run(dag, CancellationToken::new()).await;

    assert_eq!(outcome, ExecutionOutcome::Completed);
    assert_eq!(cluster.applied.lock().unwrap().as_slice(), ["deployment"]);
    assert_eq!(state.node_states["deployment"].phase, pequod_core::state::NodePhase::Ready);
}

#[tokio::test]
async fn service_waits_for_deployment_before_applying() {
    let dag = Dag::build(vec![deployment_node("deployment", &[]), deployment_node("service", &["deployment"])]).unwrap();
    let cluster = Arc::new(FakeCluster::default());
    let executor = Executor::new(cluster.clone(), cluster.clone(), ExecutorConfig::default());

    let (outcome, state) = executor.run(dag, CancellationToken::new()).await;

    assert_eq!(outcome, ExecutionOutcome::Completed);
    let applied = cluster.applied.lock().unwrap();
    let deployment_pos = applied.iter().position(|id| id == "deployment").unwrap();
    let service_pos = applied.iter().position(|id| id == "service").unwrap();
    assert!(deployment_pos < service_pos, "deployment must apply before its dependent service");
    assert_eq!(state.node_states["deployment"].phase, pequod_core::state::NodePhase::Ready);
    assert_eq!(state.node_states["service"].phase, pequod_core::state::NodePhase::Ready);
}

#[test]
fn duplicate_node_id_is_rejected_before_any_cluster_interaction() {
    let err = Dag::build(vec![deployment_node("a", &[]), deployment_node("a", &[])]).unwrap_err();
    assert_eq!(err, BuildError::DuplicateId("a".to_string()));
}
