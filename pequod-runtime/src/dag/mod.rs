//! Dependency DAG: builds and validates the graph from a rendered graph
//! record, then drives nodes through their state machine.
mod builder;
mod executor;

pub use builder::{BuildError, Dag};
pub use executor::{ApplyBackend, Executor, ExecutionOutcome, ExecutionState, ExecutorConfig, NodeBlocked, ReadinessBackend};
