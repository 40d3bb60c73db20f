//! Wires every component into a single runnable engine: one `Controller`
//! loop over graph records, one over platform definitions, an initial
//! discovery pass, and a periodic staleness sweep.
use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use kube::{runtime::controller::Controller, Api, Client};
use tracing::warn;

use crate::{
    adopter::Adopter,
    applier::Applier,
    dag::{Executor, ExecutorConfig},
    dynamic_watcher::{
        self, platform_definition_error_policy, reconcile_platform_definition, DynamicTypeWatcher, PlatformWatchContext,
    },
    events::EventSource,
    graph_reconciler::{self, GraphReconcilerContext, DEFAULT_FINALIZER},
    instance_reconciler::InstanceReconcilerContext,
    inventory::InventoryRegistry,
    metrics::Metrics,
    pruner::Pruner,
    readiness::ReadinessChecker,
    resources::{GraphRecord, PlatformDefinition},
    collaborators::Renderer,
};

/// Startup configuration for [`Manager::run`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub concurrency: usize,
    pub requeue_interval: Duration,
    pub finalizer_name: String,
    pub staleness_sweep_interval: Duration,
    pub controller_name: String,
    pub controller_pod_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            requeue_interval: Duration::from_secs(5),
            finalizer_name: DEFAULT_FINALIZER.to_string(),
            staleness_sweep_interval: Duration::from_secs(5 * 60),
            controller_name: "pequod-operator".to_string(),
            controller_pod_name: "pequod-operator".to_string(),
        }
    }
}

/// Owns every long-lived component and drives the engine's three background
/// loops (graph records, platform definitions, staleness sweep) to
/// completion.
pub struct Manager {
    client: Client,
    config: ManagerConfig,
    metrics: Arc<Metrics>,
    watcher: Arc<DynamicTypeWatcher>,
    renderer: Arc<dyn Renderer>,
}

impl Manager {
    pub fn new(client: Client, config: ManagerConfig, renderer: Arc<dyn Renderer>, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            config,
            metrics,
            watcher: Arc::new(DynamicTypeWatcher::new()),
            renderer,
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run every background loop until the first one exits (normally this
    /// only happens on a fatal client error or process shutdown).
    pub async fn run(self) {
        let event_source = EventSource {
            controller_name: self.config.controller_name.clone(),
            controller_pod_name: self.config.controller_pod_name.clone(),
        };

        let executor = Arc::new(
            Executor::new(
                Arc::new(Applier::new(self.client.clone()).with_metrics(self.metrics.clone())),
                Arc::new(ReadinessChecker::new(self.client.clone())),
                ExecutorConfig {
                    concurrency: self.config.concurrency,
                    ..ExecutorConfig::default()
                },
            )
            .with_metrics(self.metrics.clone()),
        );
        let graph_ctx = Arc::new(GraphReconcilerContext {
            client: self.client.clone(),
            adopter: Arc::new(Adopter::new(self.client.clone())),
            executor,
            inventory: Arc::new(InventoryRegistry::new()),
            pruner: Arc::new(Pruner::new(self.client.clone())),
            metrics: self.metrics.clone(),
            event_source,
            finalizer_name: self.config.finalizer_name.clone(),
            requeue_interval: self.config.requeue_interval,
        });
        let instance_ctx = Arc::new(InstanceReconcilerContext {
            client: self.client.clone(),
            watcher: self.watcher.clone(),
            renderer: self.renderer.clone(),
            requeue_interval: self.config.requeue_interval,
        });
        let platform_ctx = Arc::new(PlatformWatchContext {
            client: self.client.clone(),
            watcher: self.watcher.clone(),
            instance_ctx: instance_ctx.clone(),
            requeue_interval: self.config.requeue_interval,
        });

        dynamic_watcher::run_initial_discovery(self.client.clone(), self.watcher.clone(), instance_ctx.clone()).await;

        let sweep = tokio::spawn(dynamic_watcher::run_staleness_sweep(
            self.watcher.clone(),
            self.client.clone(),
            self.config.staleness_sweep_interval,
        ));

        let graph_api: Api<GraphRecord> = Api::all(self.client.clone());
        let graph_loop = Controller::new(graph_api, Default::default())
            .run(graph_reconciler::reconcile, graph_reconciler::error_policy, graph_ctx)
            .for_each(|res| async move {
                if let Err(err) = res {
                    warn!(error = %err, "graph record reconcile loop error");
                }
            });

        let platform_api: Api<PlatformDefinition> = Api::all(self.client.clone());
        let platform_loop = Controller::new(platform_api, Default::default())
            .run(reconcile_platform_definition, platform_definition_error_policy, platform_ctx)
            .for_each(|res| async move {
                if let Err(err) = res {
                    warn!(error = %err, "platform definition watch loop error");
                }
            });

        tokio::select! {
            _ = graph_loop => warn!("graph record controller loop exited"),
            _ = platform_loop => warn!("platform definition controller loop exited"),
            result = sweep => {
                if let Err(err) = result {
                    warn!(error = %err, "staleness sweep task panicked");
                }
            }
        }
    }
}
