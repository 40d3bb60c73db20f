//! Drives a [`Dag`]'s nodes through their state machine with a bounded pool
//! of worker tasks, backing off `WaitingReady` re-polls with the `backoff`
//! crate the same way the rest of the engine backs off transient errors.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::Utc;
use parking_lot::Mutex;
use pequod_core::{
    graph::{ApplyPolicy, NodeObject, ReadinessPredicate},
    gvk::{GroupVersionKind, ObjectIdentity},
    state::{NodePhase, NodeRuntimeState},
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::builder::Dag;
use crate::{
    applier::{ApplyError, ApplyOutcome, Applier},
    metrics::Metrics,
    readiness::{Readiness, ReadinessChecker, ReadinessError},
};

/// What the executor needs to apply a single node, abstracted so tests can
/// substitute a fake cluster without a real `kube::Client`.
#[async_trait]
pub trait ApplyBackend: Send + Sync {
    async fn apply(&self, identity: &ObjectIdentity, object: &NodeObject, policy: &ApplyPolicy) -> Result<ApplyOutcome, ApplyError>;
}

#[async_trait]
impl ApplyBackend for Applier {
    async fn apply(&self, identity: &ObjectIdentity, object: &NodeObject, policy: &ApplyPolicy) -> Result<ApplyOutcome, ApplyError> {
        Applier::apply(self, identity, object, policy).await
    }
}

/// What the executor needs to evaluate a node's readiness predicates,
/// abstracted for the same reason as [`ApplyBackend`].
#[async_trait]
pub trait ReadinessBackend: Send + Sync {
    async fn is_ready(&self, identity: &ObjectIdentity, predicates: &[ReadinessPredicate]) -> Result<Readiness, ReadinessError>;
}

#[async_trait]
impl ReadinessBackend for ReadinessChecker {
    async fn is_ready(&self, identity: &ObjectIdentity, predicates: &[ReadinessPredicate]) -> Result<Readiness, ReadinessError> {
        ReadinessChecker::is_ready(self, identity, predicates).await
    }
}

/// Why a Pending node remains blocked: the id of a dependency that is not Ready.
#[derive(Debug, Clone)]
pub struct NodeBlocked {
    pub dependency: String,
}

/// Tunables for [`Executor::run`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub readiness_poll_initial: Duration,
    pub readiness_poll_max: Duration,
    pub readiness_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            readiness_poll_initial: Duration::from_millis(250),
            readiness_poll_max: Duration::from_secs(60),
            readiness_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Snapshot returned when an execution terminates (all Ready, or all
/// remaining nodes blocked with at least one Error).
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub node_states: BTreeMap<String, NodeRuntimeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed,
    Cancelled,
}

struct Shared {
    dag: Dag,
    states: Mutex<BTreeMap<String, NodeRuntimeState>>,
    ready_queue: Mutex<VecDeque<String>>,
    in_flight: Mutex<std::collections::BTreeSet<String>>,
}

impl Shared {
    fn identity_for(&self, id: &str) -> ObjectIdentity {
        let node = self.dag.node(id).expect("node exists");
        let gvk = GroupVersionKind::from_api_version_kind(&node.object.api_version, &node.object.kind)
            .unwrap_or_else(|_| GroupVersionKind::gvk("", &node.object.api_version, &node.object.kind));
        ObjectIdentity::new(gvk, node.object.namespace.clone(), node.object.name.clone())
    }

    fn transition(&self, id: &str, phase: NodePhase, message: Option<String>) {
        let mut states = self.states.lock();
        let state = states.entry(id.to_string()).or_insert_with(NodeRuntimeState::pending);
        let now = Utc::now();
        state.transition(phase, now);
        state.message = message;
        match phase {
            NodePhase::Applying => {
                state.applied_at.get_or_insert(now);
            }
            NodePhase::Ready => {
                state.ready_at.get_or_insert(now);
            }
            _ => {}
        }
    }

    fn all_ready(&self) -> bool {
        let states = self.states.lock();
        !states.is_empty() && states.values().all(|s| s.phase == NodePhase::Ready)
    }

    fn is_terminal(&self) -> bool {
        let states = self.states.lock();
        let any_in_flight = states
            .values()
            .any(|s| matches!(s.phase, NodePhase::Pending | NodePhase::Applying | NodePhase::WaitingReady));
        !any_in_flight
    }

    fn has_error(&self) -> bool {
        self.states.lock().values().any(|s| s.phase == NodePhase::Error)
    }

    /// After `id` becomes Ready, push any dependent whose dependencies are
    /// now all Ready onto the queue.
    fn promote_dependents(&self, id: &str) {
        let states = self.states.lock();
        let ready_ids: std::collections::BTreeSet<String> =
            states.iter().filter(|(_, s)| s.phase == NodePhase::Ready).map(|(id, _)| id.clone()).collect();
        let mut newly_ready = Vec::new();
        for dependent in self.dag.dependents(id) {
            if states.get(dependent).map(|s| s.phase) != Some(NodePhase::Pending) {
                continue;
            }
            if self.dag.dependencies(dependent).all(|dep| ready_ids.contains(dep)) {
                newly_ready.push(dependent.to_string());
            }
        }
        drop(states);
        let mut queue = self.ready_queue.lock();
        for id in newly_ready {
            queue.push_back(id);
        }
    }
}

/// Drives a validated [`Dag`] to completion against the cluster, calling out
/// to the applier and readiness checker for each node.
pub struct Executor {
    applier: Arc<dyn ApplyBackend>,
    readiness: Arc<dyn ReadinessBackend>,
    config: ExecutorConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Executor {
    pub fn new(applier: Arc<dyn ApplyBackend>, readiness: Arc<dyn ReadinessBackend>, config: ExecutorConfig) -> Self {
        Self { applier, readiness, config, metrics: None }
    }

    /// Attach a metrics sink so every node records `pequod_node_execution_duration_seconds`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[instrument(skip(self, dag, cancel), fields(dag.nodes = dag.len()))]
    pub async fn run(&self, dag: Dag, cancel: CancellationToken) -> (ExecutionOutcome, ExecutionState) {
        let initial_states: BTreeMap<String, NodeRuntimeState> =
            dag.ids().map(|id| (id.to_string(), NodeRuntimeState::pending())).collect();
        let initial_ready: VecDeque<String> = dag
            .ids()
            .filter(|id| dag.dependencies(id).next().is_none())
            .map(str::to_string)
            .collect();

        let shared = Arc::new(Shared {
            dag,
            states: Mutex::new(initial_states),
            ready_queue: Mutex::new(initial_ready),
            in_flight: Mutex::new(std::collections::BTreeSet::new()),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut workers = Vec::new();
        for _ in 0..self.config.concurrency.max(1) {
            let shared = shared.clone();
            let semaphore = semaphore.clone();
            let applier = self.applier.clone();
            let readiness = self.readiness.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(shared, semaphore, applier, readiness, config, cancel, metrics).await;
            }));
        }

        loop {
            if cancel.is_cancelled() {
                cancel_remaining(&shared);
                break;
            }
            if shared.all_ready() {
                break;
            }
            if shared.is_terminal() && shared.has_error() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for worker in workers {
            worker.abort();
        }

        let outcome = if cancel.is_cancelled() {
            ExecutionOutcome::Cancelled
        } else if shared.all_ready() {
            ExecutionOutcome::Completed
        } else {
            ExecutionOutcome::Failed
        };
        let node_states = shared.states.lock().clone();
        (outcome, ExecutionState { node_states })
    }
}

fn cancel_remaining(shared: &Shared) {
    let mut states = shared.states.lock();
    for state in states.values_mut() {
        if !state.phase.is_terminal() {
            state.phase = NodePhase::Error;
            state.last_error = Some("cancelled".to_string());
            state.last_transition_time = Some(Utc::now());
        }
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    semaphore: Arc<Semaphore>,
    applier: Arc<dyn ApplyBackend>,
    readiness: Arc<dyn ReadinessBackend>,
    config: ExecutorConfig,
    cancel: CancellationToken,
    metrics: Option<Arc<Metrics>>,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let next_id = {
            let mut queue = shared.ready_queue.lock();
            let mut in_flight = shared.in_flight.lock();
            let candidate = queue.iter().position(|id| !in_flight.contains(id)).map(|i| queue.remove(i).unwrap());
            if let Some(id) = &candidate {
                in_flight.insert(id.clone());
            }
            candidate
        };
        let Some(id) = next_id else {
            tokio::time::sleep(Duration::from_millis(20)).await;
            continue;
        };

        let _permit = tokio::select! {
            permit = semaphore.acquire() => permit.expect("semaphore is never closed"),
            _ = cancel.cancelled() => {
                shared.in_flight.lock().remove(&id);
                return;
            }
        };

        run_node(&shared, &applier, &readiness, &config, &cancel, &id, metrics.as_deref()).await;
        shared.in_flight.lock().remove(&id);
    }
}

#[instrument(skip(shared, applier, readiness, config, cancel, metrics), fields(node.id = %id))]
async fn run_node(
    shared: &Arc<Shared>,
    applier: &Arc<dyn ApplyBackend>,
    readiness: &Arc<dyn ReadinessBackend>,
    config: &ExecutorConfig,
    cancel: &CancellationToken,
    id: &str,
    metrics: Option<&Metrics>,
) {
    let node = shared.dag.node(id).expect("node exists").clone();
    let identity = shared.identity_for(id);
    let node_started = tokio::time::Instant::now();
    let record = |result: &str| {
        if let Some(metrics) = metrics {
            metrics.node_execution_duration_seconds.with_label_values(&[result]).observe(node_started.elapsed().as_secs_f64());
        }
    };

    shared.transition(id, NodePhase::Applying, None);
    let apply_result = tokio::select! {
        result = applier.apply(&identity, &node.object, &node.apply_policy) => result,
        _ = cancel.cancelled() => {
            shared.transition(id, NodePhase::Error, Some("cancelled".to_string()));
            record("error");
            return;
        }
    };

    let _: ApplyOutcome = match apply_result {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!(node.id = %id, error = %err, "node apply failed");
            record_error(shared, id, &err);
            record("error");
            return;
        }
    };

    if node.ready_when.is_empty() {
        info!(node.id = %id, "node ready (no readiness predicates)");
        shared.transition(id, NodePhase::Ready, None);
        shared.promote_dependents(id);
        record("success");
        return;
    }

    shared.transition(id, NodePhase::WaitingReady, None);
    let waited_since = tokio::time::Instant::now();
    let mut backoff = ExponentialBackoff {
        initial_interval: config.readiness_poll_initial,
        max_interval: config.readiness_poll_max,
        max_elapsed_time: Some(config.readiness_timeout),
        ..ExponentialBackoff::default()
    };

    loop {
        if cancel.is_cancelled() {
            shared.transition(id, NodePhase::Error, Some("cancelled".to_string()));
            record("error");
            return;
        }
        if waited_since.elapsed() > config.readiness_timeout {
            shared.transition(id, NodePhase::Error, Some("readiness-timeout".to_string()));
            record("error");
            return;
        }
        match readiness.is_ready(&identity, &node.ready_when).await {
            Ok(Readiness::Ready) => {
                info!(node.id = %id, "node ready");
                shared.transition(id, NodePhase::Ready, None);
                shared.promote_dependents(id);
                record("success");
                return;
            }
            Ok(Readiness::NotReady(not_ready)) => {
                let Some(delay) = backoff.next_backoff() else {
                    shared.transition(id, NodePhase::Error, Some("readiness-timeout".to_string()));
                    record("error");
                    return;
                };
                shared.transition(id, NodePhase::WaitingReady, Some(not_ready.reason));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        shared.transition(id, NodePhase::Error, Some("cancelled".to_string()));
                        record("error");
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(node.id = %id, error = %err, "readiness check failed, retrying");
                let Some(delay) = backoff.next_backoff() else {
                    shared.transition(id, NodePhase::Error, Some(err.to_string()));
                    record("error");
                    return;
                };
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn record_error(shared: &Arc<Shared>, id: &str, err: &ApplyError) {
    let mut states = shared.states.lock();
    let state = states.entry(id.to_string()).or_insert_with(NodeRuntimeState::pending);
    state.phase = NodePhase::Error;
    state.last_error = Some(err.to_string());
    state.last_transition_time = Some(Utc::now());
}
