//! Binary entry point: parses configuration, wires up tracing, starts the
//! metrics HTTP server, and runs the operator manager to completion.
mod config;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use pequod_runtime::{
    collaborators::{GraphRecordContents, RenderError, Renderer},
    manager::{Manager, ManagerConfig},
    metrics::Metrics,
    resources::Instance,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use config::Cli;

/// Placeholder for the template/schema rendering system, which per this
/// engine's scope lives outside the repository. A real deployment replaces
/// this with a [`Renderer`] that resolves a platform's module and produces a
/// graph from the instance's fields.
struct UnconfiguredRenderer;

#[async_trait::async_trait]
impl Renderer for UnconfiguredRenderer {
    async fn render(&self, _instance: &Instance, module_ref: &str) -> Result<GraphRecordContents, RenderError> {
        Err(RenderError::ModuleResolution {
            module_ref: module_ref.to_string(),
            message: "no renderer is configured; wire a Renderer implementation into the manager".to_string(),
        })
    }
}

async fn serve_metrics(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<()> {
    let listener = TcpListener::bind(addr).await.with_context(|| format!("binding metrics listener on {addr}"))?;
    tracing::info!(%addr, "metrics endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = metrics.clone();
                async move {
                    let body = if req.uri().path() == "/metrics" {
                        metrics.encode()
                    } else {
                        b"not found".to_vec()
                    };
                    Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
                }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::warn!(error = %err, "metrics connection error");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = kube::Client::try_default().await.context("building Kubernetes client")?;
    let metrics = Arc::new(Metrics::new());
    let metrics_addr: SocketAddr = cli.metrics_addr.parse().context("parsing --metrics-addr")?;

    let manager = Manager::new(
        client,
        ManagerConfig {
            concurrency: cli.concurrency,
            requeue_interval: cli.requeue_interval,
            finalizer_name: cli.finalizer,
            staleness_sweep_interval: cli.staleness_sweep_interval,
            ..ManagerConfig::default()
        },
        Arc::new(UnconfiguredRenderer),
        metrics.clone(),
    );

    tokio::select! {
        result = serve_metrics(metrics_addr, metrics) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "metrics server exited");
            }
        }
        _ = manager.run() => {
            tracing::warn!("manager exited");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    Ok(())
}
