//! Render backends.
//!
//! A backend knows how to compile a composition into a bundle, launch the
//! shared render engine and render one job against both. The engine core
//! never talks to external programs directly.

pub mod command;
pub mod engine;
pub mod progress;
pub mod templates;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::compile::{CacheKey, CompiledArtifact};
use crate::domain::{OutputGeometry, RenderParams};

pub use command::{CommandBackend, CommandBackendConfig};
pub use engine::EngineInstance;
pub use progress::{ProgressReporter, ProgressUpdate};
pub use templates::{Template, TemplateLibrary};

/// Everything needed to compile one composition.
#[derive(Debug, Clone)]
pub struct CompileUnit {
    pub key: CacheKey,
    /// Template name or `<inline>`.
    pub label: String,
    pub source: String,
    /// File name the source is written under, e.g. `composition.tsx`.
    pub file_name: String,
    pub geometry: OutputGeometry,
    pub inline: bool,
}

/// One render call.
pub struct RenderInvocation {
    pub job_id: String,
    pub artifact: Arc<CompiledArtifact>,
    pub engine: Arc<EngineInstance>,
    pub geometry: OutputGeometry,
    pub params: RenderParams,
    pub output_path: PathBuf,
    pub progress: ProgressReporter,
    /// Cancelled on caller cancel or deadline; the render must stop promptly.
    pub cancel: CancellationToken,
}

/// What a successful render produced.
#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub path: PathBuf,
}

#[async_trait]
pub trait RenderBackend: Send + Sync {
    /// Backend name, for logs and health.
    fn name(&self) -> &'static str;

    /// Whether caller-supplied composition source runs inside a hardened
    /// execution boundary.
    fn supports_inline_source(&self) -> bool;

    /// Compile a composition into a bundle.
    async fn compile(&self, unit: &CompileUnit) -> Result<CompiledArtifact>;

    /// Start the shared render engine.
    async fn launch(&self) -> Result<EngineInstance>;

    /// Render one job. Must return `Error::Cancelled` promptly once
    /// `invocation.cancel` fires.
    async fn render(&self, invocation: RenderInvocation) -> Result<RenderOutput>;
}
