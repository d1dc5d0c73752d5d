//! Service container.
//!
//! Builds every engine component from an [`EngineConfig`], owns their
//! background tasks and shuts them down in order.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::api::AppState;
use crate::api::middleware::ApiKeyAuth;
use crate::backend::{CommandBackend, RenderBackend, TemplateLibrary};
use crate::callback::{CallbackDispatcher, CallbackPolicy, CallbackSigner};
use crate::compile::CompileCache;
use crate::config::EngineConfig;
use crate::metrics::HealthChecker;
use crate::pool::ResourcePool;
use crate::scheduler::{Executor, GarbageCollector, JobStore, Scheduler};
use crate::utils::fs;

/// How long background tasks get to exit after cancellation.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Container holding all engine services.
pub struct ServiceContainer {
    pub config: EngineConfig,
    pub backend: Arc<dyn RenderBackend>,
    pub cache: Arc<CompileCache>,
    pub pool: Arc<ResourcePool>,
    pub store: Arc<JobStore>,
    pub dispatcher: Arc<CallbackDispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub health_checker: Arc<HealthChecker>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    /// Build the container with the command backend described by `config`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        let backend = Arc::new(CommandBackend::new(config.backend.clone())?);
        Self::with_backend(config, backend)
    }

    /// Build the container around a given render backend.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn RenderBackend>) -> Result<Self> {
        config.validate()?;

        let templates = TemplateLibrary::new(&config.templates_dir);
        let cache = Arc::new(CompileCache::new(config.cache.clone()));
        let pool = ResourcePool::new(backend.clone(), config.pool.clone());
        let store = Arc::new(JobStore::new(config.store.clone()));

        let policy = CallbackPolicy::new(config.callback_allowlist.iter())
            .with_dns_check(config.callback_dns_check)
            .with_resolve_timeout(config.callback_resolve_timeout);
        let signer = config
            .callback_secret
            .as_deref()
            .map(|secret| CallbackSigner::new(secret.as_bytes()))
            .transpose()?;
        let dispatcher = Arc::new(CallbackDispatcher::new(
            config.callback.clone(),
            Arc::new(policy),
            signer,
        ));

        let executor = Arc::new(Executor::new(
            config.executor.clone(),
            backend.clone(),
            templates.clone(),
            cache.clone(),
            pool.clone(),
        ));
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            store.clone(),
            executor,
            backend.clone(),
            templates,
            dispatcher.clone(),
        );
        let health_checker = Arc::new(HealthChecker::new(
            scheduler.clone(),
            cache.clone(),
            pool.clone(),
            dispatcher.clone(),
        ));

        Ok(Self {
            config,
            backend,
            cache,
            pool,
            store,
            dispatcher,
            scheduler,
            health_checker,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Create working directories and start workers, the garbage collector
    /// and the engine reaper.
    pub async fn initialize(&self) -> Result<()> {
        for warning in self.config.warnings() {
            warn!("{warning}");
        }
        fs::ensure_dir_all_with_op("creating output directory", &self.config.executor.output_dir)
            .await?;
        fs::ensure_dir_all_with_op("creating bundle directory", &self.config.backend.bundles_dir)
            .await?;
        fs::ensure_dir_all_with_op("creating work directory", &self.config.backend.work_dir)
            .await?;
        if !self.config.templates_dir.is_dir() {
            warn!(
                path = %self.config.templates_dir.display(),
                "Template directory does not exist, template requests will be rejected"
            );
        }

        self.scheduler.start();

        let gc = GarbageCollector::new(self.config.gc.clone(), self.store.clone());
        let mut tasks = self.tasks.lock();
        tasks.push(gc.start_background_task(self.cancellation_token.child_token()));
        tasks.push(self.pool.start_reaper(self.cancellation_token.child_token()));

        info!(
            backend = self.backend.name(),
            concurrency = self.config.scheduler.concurrency,
            max_jobs = self.config.store.max_jobs,
            cache_capacity = self.config.cache.capacity,
            "Services initialized"
        );
        Ok(())
    }

    /// State for the API server.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.scheduler.clone(),
            self.health_checker.clone(),
            &self.config.callback.public_base_url,
            &self.config.executor.output_dir,
        )
        .with_auth(ApiKeyAuth::new(self.config.api_secret.as_deref()))
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) {
        info!("Shutting down services (timeout: {:?})", timeout);

        // Signal all background tasks to stop
        self.cancellation_token.cancel();

        self.scheduler.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let wait = futures::future::join_all(tasks);
        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Stopping render engine...");
        self.pool.shutdown().await;

        info!("Services shut down");
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
