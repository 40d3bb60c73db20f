//! Command-line configuration, with environment-variable fallback for every flag.
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "pequod", about = "Kubernetes control-plane operator for platform-defined resources")]
pub struct Cli {
    /// Maximum nodes the DAG executor applies concurrently across all graphs.
    #[arg(long, env = "PEQUOD_CONCURRENCY", default_value_t = 8)]
    pub concurrency: usize,

    /// How long a graph reconcile waits before requeuing while a node is still WaitingReady.
    #[arg(long, env = "PEQUOD_REQUEUE_INTERVAL", value_parser = humantime::parse_duration, default_value = "5s")]
    pub requeue_interval: Duration,

    /// Address the Prometheus metrics endpoint binds to.
    #[arg(long, env = "PEQUOD_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    pub metrics_addr: String,

    /// Finalizer name added to every graph record this operator manages.
    #[arg(long, env = "PEQUOD_FINALIZER", default_value = "pequod.io/graph-finalizer")]
    pub finalizer: String,

    /// How often the dynamic-type watcher re-verifies watched types are still established.
    #[arg(long, env = "PEQUOD_STALENESS_SWEEP_INTERVAL", value_parser = humantime::parse_duration, default_value = "5m")]
    pub staleness_sweep_interval: Duration,
}
