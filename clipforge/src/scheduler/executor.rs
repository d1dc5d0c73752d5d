//! Runs one job: compile (through the cache), lease the engine, render.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CompileUnit, ProgressReporter, RenderBackend, RenderInvocation, TemplateLibrary};
use crate::compile::{CacheKey, CompileCache};
use crate::domain::{Composition, Job};
use crate::pool::ResourcePool;
use crate::utils::fs;
use crate::{Error, Result};

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Directory rendered outputs are written to.
    pub output_dir: PathBuf,
    /// Output container extension, without the dot.
    pub output_extension: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/outputs"),
            output_extension: "mp4".to_string(),
        }
    }
}

pub struct Executor {
    config: ExecutorConfig,
    backend: Arc<dyn RenderBackend>,
    templates: TemplateLibrary,
    cache: Arc<CompileCache>,
    pool: Arc<ResourcePool>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        backend: Arc<dyn RenderBackend>,
        templates: TemplateLibrary,
        cache: Arc<CompileCache>,
        pool: Arc<ResourcePool>,
    ) -> Self {
        Self {
            config,
            backend,
            templates,
            cache,
            pool,
        }
    }

    pub fn output_path(&self, job_id: &str) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{job_id}.{}", self.config.output_extension))
    }

    async fn compile_unit(&self, job: &Job) -> Result<CompileUnit> {
        let geometry = job.spec.geometry;
        let (source, file_name) = match &job.spec.composition {
            Composition::Template { name } => {
                let template = self.templates.resolve(name).await?;
                let file_name = template.file_name();
                (template.source, file_name)
            }
            Composition::Inline { source } => (source.clone(), "composition.tsx".to_string()),
        };

        Ok(CompileUnit {
            key: CacheKey::new(&source, &geometry),
            label: job.spec.composition.label().to_string(),
            source,
            file_name,
            geometry,
            inline: job.spec.composition.is_inline(),
        })
    }

    /// Execute a job and return the output path.
    ///
    /// Returns `Error::Cancelled` as soon as `cancel` fires, at any stage.
    pub async fn execute(
        &self,
        job: &Job,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<PathBuf> {
        let unit = self.compile_unit(job).await?;
        let key = unit.key.clone();

        let artifact = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            artifact = self.cache.ensure(&key, || self.backend.compile(&unit)) => artifact?,
        };
        debug!(job_id = %job.id, key = %key.short(), "Composition ready");

        let lease = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            lease = self.pool.acquire() => lease?,
        };

        let output_path = self.output_path(&job.id);
        fs::ensure_dir_all_with_op("creating output directory", &self.config.output_dir).await?;

        info!(
            job_id = %job.id,
            composition = %unit.label,
            engine = lease.engine().id(),
            "Rendering"
        );
        let result = self
            .backend
            .render(RenderInvocation {
                job_id: job.id.clone(),
                artifact,
                engine: lease.engine().clone(),
                geometry: job.spec.geometry,
                params: job.spec.params.clone(),
                output_path: output_path.clone(),
                progress,
                cancel,
            })
            .await;
        drop(lease);

        match result {
            Ok(output) => Ok(output.path),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file_if_exists(&output_path).await {
                    warn!(job_id = %job.id, error = %cleanup, "Failed to remove partial output");
                }
                Err(e)
            }
        }
    }
}
