//! Shared harness for integration tests: an in-process render backend and a
//! fully wired engine rooted in a temporary directory.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clipforge::backend::{
    CompileUnit, EngineInstance, RenderBackend, RenderInvocation, RenderOutput,
};
use clipforge::compile::CompiledArtifact;
use clipforge::config::EngineConfig;
use clipforge::domain::{ClipRef, Job, JobStatus, RenderRequest};
use clipforge::services::ServiceContainer;
use clipforge::{Error, Result};
use tempfile::TempDir;

/// Render backend that never leaves the process.
#[derive(Default)]
pub struct FakeBackend {
    pub compiles: AtomicUsize,
    pub launches: AtomicUsize,
    pub renders: AtomicUsize,
    /// Time each compile takes.
    pub compile_delay_ms: AtomicUsize,
    /// Time each render takes.
    pub render_delay_ms: AtomicUsize,
    pub fail_compile: AtomicBool,
    pub fail_render: AtomicBool,
    /// Keep rendering after the cancel token fires.
    pub ignore_cancel: AtomicBool,
    pub inline_source: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_render_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        self.render_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn supports_inline_source(&self) -> bool {
        self.inline_source.load(Ordering::SeqCst)
    }

    async fn compile(&self, unit: &CompileUnit) -> Result<CompiledArtifact> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let delay = self.compile_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_compile.load(Ordering::SeqCst) {
            return Err(Error::compile(format!("syntax error in {}", unit.label)));
        }
        Ok(CompiledArtifact::new(
            unit.key.clone(),
            format!("/bundles/{}", unit.key.short()),
            format!("/bundles/{}/index.js", unit.key.short()),
        ))
    }

    async fn launch(&self) -> Result<EngineInstance> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(EngineInstance::detached(Some(format!("fake-engine-{n}"))))
    }

    async fn render(&self, invocation: RenderInvocation) -> Result<RenderOutput> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let delay = Duration::from_millis(self.render_delay_ms.load(Ordering::SeqCst) as u64);

        invocation.progress.report(0.5);
        if self.ignore_cancel.load(Ordering::SeqCst) {
            tokio::time::sleep(delay).await;
        } else {
            tokio::select! {
                _ = invocation.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.fail_render.load(Ordering::SeqCst) {
            return Err(Error::render("encoder exited with status 1"));
        }

        tokio::fs::write(&invocation.output_path, b"fake video").await?;
        invocation.progress.report(1.0);
        Ok(RenderOutput {
            path: invocation.output_path,
        })
    }
}

/// A running engine and the directory it lives in.
pub struct TestEngine {
    pub dir: TempDir,
    pub backend: Arc<FakeBackend>,
    pub services: ServiceContainer,
}

impl TestEngine {
    pub async fn start(backend: Arc<FakeBackend>) -> Self {
        Self::start_with(backend, |_| {}).await
    }

    pub async fn start_with(
        backend: Arc<FakeBackend>,
        configure: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_data_dir(dir.path().to_path_buf());
        config.callback.public_base_url = "http://renders.test".to_string();
        config.scheduler.poll_interval = Duration::from_millis(20);
        config.scheduler.cancel_grace = Duration::from_millis(500);
        configure(&mut config);

        std::fs::create_dir_all(&config.templates_dir).unwrap();
        std::fs::write(
            config.templates_dir.join("promo.json"),
            br#"{"scenes": [{"type": "clip", "index": 0}]}"#,
        )
        .unwrap();

        let services = ServiceContainer::with_backend(config, backend.clone()).unwrap();
        services.initialize().await.unwrap();

        Self {
            dir,
            backend,
            services,
        }
    }

    pub async fn submit(&self, request: &RenderRequest) -> Result<Job> {
        self.services.scheduler.submit(request).await
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_terminal(&self, job_id: &str, within: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let job = self.services.scheduler.get_job(job_id).unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} still {} after {within:?}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the job reaches `status`.
    pub async fn wait_status(&self, job_id: &str, status: JobStatus, within: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let job = self.services.scheduler.get_job(job_id).unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {job_id} is {} instead of {status} after {within:?}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.services.shutdown_with_timeout(Duration::from_secs(2)).await;
    }
}

/// 150 frames at 30 fps, 1080x1920, one clip, no callback.
pub fn promo_request(clip: &str) -> RenderRequest {
    RenderRequest {
        template: Some("promo".to_string()),
        clips: vec![ClipRef::Url(clip.to_string())],
        duration_frames: Some(150),
        fps: 30,
        width: 1080,
        height: 1920,
        ..Default::default()
    }
}
