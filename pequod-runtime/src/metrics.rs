//! Prometheus metrics surface: reconciles, apply operations, adoptions,
//! durations, and gauges for managed-object and DAG-node counts.
use prometheus::{
    register_gauge_vec_with_registry, register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    Encoder, GaugeVec, HistogramVec, IntCounterVec, Registry, TextEncoder,
};

/// All metrics the engine exposes, bound to a private [`Registry`] rather
/// than the global default so tests can construct isolated instances.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub reconciles_total: IntCounterVec,
    pub apply_operations_total: IntCounterVec,
    pub adoptions_total: IntCounterVec,
    pub reconcile_duration_seconds: HistogramVec,
    pub dag_execution_duration_seconds: HistogramVec,
    pub node_execution_duration_seconds: HistogramVec,
    pub managed_objects: GaugeVec,
    pub dag_nodes: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let reconciles_total = register_int_counter_vec_with_registry!(
            "pequod_reconciles_total",
            "Graph and instance reconciles, by result.",
            &["result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let apply_operations_total = register_int_counter_vec_with_registry!(
            "pequod_apply_operations_total",
            "Apply operations issued against the cluster, by mode and result.",
            &["mode", "result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let adoptions_total = register_int_counter_vec_with_registry!(
            "pequod_adoptions_total",
            "Adoption attempts, by result.",
            &["result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let reconcile_duration_seconds = register_histogram_vec_with_registry!(
            "pequod_reconcile_duration_seconds",
            "Time spent in a single graph-record reconcile.",
            &["result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let dag_execution_duration_seconds = register_histogram_vec_with_registry!(
            "pequod_dag_execution_duration_seconds",
            "Time spent executing a graph's DAG to completion.",
            &["result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let node_execution_duration_seconds = register_histogram_vec_with_registry!(
            "pequod_node_execution_duration_seconds",
            "Time spent applying and waiting for readiness on a single node.",
            &["result"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let managed_objects = register_gauge_vec_with_registry!(
            "pequod_managed_objects",
            "Objects currently tracked in the inventory.",
            &["graph"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");
        let dag_nodes = register_gauge_vec_with_registry!(
            "pequod_dag_nodes",
            "Node count of the most recently executed DAG, per graph.",
            &["graph"],
            registry
        )
        .expect("metric registration is infallible for a fresh registry");

        Self {
            registry,
            reconciles_total,
            apply_operations_total,
            adoptions_total,
            reconcile_duration_seconds,
            dag_execution_duration_seconds,
            node_execution_duration_seconds,
            managed_objects,
            dag_nodes,
        }
    }

    /// Render the current metric snapshot in Prometheus text exposition format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).expect("encoding to an in-memory buffer cannot fail");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
