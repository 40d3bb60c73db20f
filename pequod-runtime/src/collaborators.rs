//! External collaborator interfaces the instance reconciler calls out to.
//! Neither is implemented here: the template/schema engine and module
//! fetcher live outside this engine and are injected as trait objects.
use async_trait::async_trait;
use pequod_core::graph::{AdoptionSpec, GraphMetadata, NodeSpec, PolicyViolation};
use thiserror::Error;

use crate::resources::Instance;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to resolve module {module_ref:?}: {message}")]
    ModuleResolution { module_ref: String, message: String },
    #[error("template rendering failed: {0}")]
    Template(String),
}

/// The contents a [`Renderer`] produces for one instance; everything except
/// `render_hash`/`rendered_at`, which the instance reconciler stamps itself.
#[derive(Debug, Clone)]
pub struct GraphRecordContents {
    pub metadata: GraphMetadata,
    pub nodes: Vec<NodeSpec>,
    pub violations: Vec<PolicyViolation>,
    pub adopt: Option<AdoptionSpec>,
}

/// Turns a developer-created instance into a rendered graph. Implemented
/// outside this engine by the template/schema system.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, instance: &Instance, module_ref: &str) -> Result<GraphRecordContents, RenderError>;
}

/// Resolves a module reference (OCI/Git/ConfigMap/inline/embedded) to bytes
/// plus a resolved digest. Errors surface to callers as [`RenderError`].
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, module_ref: &str) -> Result<(Vec<u8>, String), RenderError>;
}
