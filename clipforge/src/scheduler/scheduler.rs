//! Admission and the worker pool.
//!
//! `submit` validates and admits synchronously; `concurrency` workers pull
//! admitted jobs in FIFO order and run them through the executor under the
//! render deadline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::executor::Executor;
use super::job_store::{CancelOutcome, JobStore};
use crate::backend::{ProgressReporter, ProgressUpdate, RenderBackend, TemplateLibrary};
use crate::callback::CallbackDispatcher;
use crate::domain::{Composition, Job, JobOutcome, RenderRequest, RequestLimits};
use crate::utils::fs;
use crate::{Error, Result};

/// Buffered progress updates before new ones are dropped.
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers, i.e. maximum concurrent renders.
    pub concurrency: usize,
    /// Deadline for one job's whole execution.
    pub render_timeout: Duration,
    /// How long a timed-out or shut-down render may take to stop.
    pub cancel_grace: Duration,
    /// Fallback wake-up for idle workers.
    pub poll_interval: Duration,
    /// Accept inline composition source (also requires a sandboxed backend).
    pub allow_custom_source: bool,
    pub limits: RequestLimits,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            render_timeout: Duration::from_secs(600),
            cancel_grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
            allow_custom_source: false,
            limits: RequestLimits::default(),
        }
    }
}

/// Scheduler counters for health.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub concurrency: usize,
    pub queue_depth: usize,
    pub running: usize,
    pub outstanding: usize,
    pub max_jobs: usize,
    pub uptime_secs: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    executor: Arc<Executor>,
    backend: Arc<dyn RenderBackend>,
    templates: TemplateLibrary,
    dispatcher: Arc<CallbackDispatcher>,
    queue: parking_lot::Mutex<VecDeque<String>>,
    notify: Notify,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    progress_rx: parking_lot::Mutex<Option<mpsc::Receiver<ProgressUpdate>>>,
    running: AtomicUsize,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    started_at: Instant,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<JobStore>,
        executor: Arc<Executor>,
        backend: Arc<dyn RenderBackend>,
        templates: TemplateLibrary,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Arc<Self> {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            store,
            executor,
            backend,
            templates,
            dispatcher,
            queue: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            progress_tx,
            progress_rx: parking_lot::Mutex::new(Some(progress_rx)),
            running: AtomicUsize::new(0),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validate and admit a render request.
    ///
    /// Returns the pending job, or a submission error (`Validation`,
    /// `Allowlist`, `Capacity`) without creating any record.
    pub async fn submit(&self, request: &RenderRequest) -> Result<Job> {
        let spec = request.validate(&self.config.limits)?;

        match &spec.composition {
            Composition::Template { name } => {
                if !self.templates.exists(name) {
                    return Err(Error::validation(format!("unknown template '{name}'")));
                }
            }
            Composition::Inline { .. } => {
                if !self.config.allow_custom_source {
                    return Err(Error::validation(
                        "inline composition source is disabled on this server",
                    ));
                }
                if !self.backend.supports_inline_source() {
                    return Err(Error::validation(
                        "inline composition source requires a sandboxed render backend",
                    ));
                }
            }
        }

        if let Some(url) = &spec.callback {
            self.dispatcher.policy().validate(url).await?;
        }

        let job = self.store.create(spec)?;
        self.queue.lock().push_back(job.id.clone());
        self.notify.notify_one();

        info!(
            job_id = %job.id,
            composition = %job.spec.composition.label(),
            frames = job.spec.geometry.duration_frames,
            "Render job submitted"
        );
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.store.get(id).ok_or_else(|| Error::not_found("Job", id))
    }

    /// Cancel a job; see [`JobStore::cancel`].
    pub fn cancel_job(&self, id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.cancel(id)?;
        match &outcome {
            CancelOutcome::Cancelled(job) => {
                self.queue.lock().retain(|queued| queued != id);
                info!(job_id = %id, "Pending job cancelled");
                self.dispatcher.notify(job);
            }
            CancelOutcome::Cancelling(_) => {
                info!(job_id = %id, "Cancellation requested for running job");
            }
        }
        Ok(outcome)
    }

    /// Start the workers and the progress consumer.
    pub fn start(self: &Arc<Self>) {
        info!(
            concurrency = self.config.concurrency,
            max_jobs = self.store.config().max_jobs,
            backend = self.backend.name(),
            "Starting render scheduler"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("Scheduler already stopped, not starting workers");
            return;
        };

        if let Some(mut rx) = self.progress_rx.lock().take() {
            let store = self.store.clone();
            let cancel = self.cancellation_token.clone();
            join_set.spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        update = rx.recv() => match update {
                            Some(update) => store.update_progress(&update.job_id, update.fraction),
                            None => break,
                        }
                    }
                }
            });
        }

        for worker in 0..self.config.concurrency {
            let scheduler = self.clone();
            join_set.spawn(async move {
                debug!(worker, "Render worker started");
                scheduler.worker_loop(worker).await;
                debug!(worker, "Render worker stopped");
            });
        }
    }

    async fn worker_loop(&self, worker: usize) {
        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let next = self.queue.lock().pop_front();
            let Some(job_id) = next else {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            self.run_job(worker, &job_id).await;
        }
    }

    async fn run_job(&self, worker: usize, job_id: &str) {
        let job = match self.store.mark_running(job_id) {
            Ok(job) => job,
            Err(e) => {
                debug!(job_id, error = %e, "Skipping dequeued job");
                return;
            }
        };
        let Some(token) = self.store.cancellation_token(job_id) else {
            warn!(job_id, "Running job has no cancellation token");
            return;
        };

        self.running.fetch_add(1, Ordering::AcqRel);
        let started = Instant::now();
        debug!(job_id, worker, queue_wait = ?job.queue_wait(), "Job started");

        let progress = ProgressReporter::new(
            job_id,
            job.spec.geometry.duration_frames,
            self.progress_tx.clone(),
        );
        let execution = self.executor.execute(&job, progress, token.clone());
        tokio::pin!(execution);

        let outcome = tokio::select! {
            result = &mut execution => match result {
                Ok(output) => JobOutcome::Completed { output },
                Err(_) if token.is_cancelled() => JobOutcome::Cancelled {
                    reason: "cancelled by request".to_string(),
                },
                Err(e) => JobOutcome::Failed { error: e.to_string() },
            },
            _ = tokio::time::sleep(self.config.render_timeout) => {
                let timeout_ms = self.config.render_timeout.as_millis() as u64;
                warn!(job_id, timeout_ms, "Render timed out, cancelling");
                token.cancel();
                if tokio::time::timeout(self.config.cancel_grace, &mut execution).await.is_err() {
                    warn!(job_id, "Render did not stop within grace period, abandoning it");
                }
                JobOutcome::Failed { error: Error::Timeout(timeout_ms).to_string() }
            }
        };
        drop(execution);

        // A render that outlived its deadline may still have written output.
        if !matches!(outcome, JobOutcome::Completed { .. }) {
            let output_path = self.executor.output_path(job_id);
            if let Err(e) = fs::remove_file_if_exists(&output_path).await {
                warn!(job_id, error = %e, "Failed to remove output of unsuccessful job");
            }
        }

        let status = outcome.status();
        match self.store.finish(job_id, outcome) {
            Ok(job) => {
                info!(
                    job_id,
                    status = %status,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = job.error.as_deref().unwrap_or(""),
                    "Job finished"
                );
                self.dispatcher.notify(&job);
            }
            Err(e) => warn!(job_id, error = %e, "Could not record job outcome"),
        }

        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Stop the workers. Running renders get `cancel_grace` to finish before
    /// their tokens are cancelled.
    pub async fn shutdown(&self) {
        info!("Stopping render scheduler");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return;
        };

        let drain = async { while join_set.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.cancel_grace, drain).await.is_err() {
            let cancelled = self.store.cancel_running();
            warn!(cancelled, "Workers still busy, cancelling running renders");

            let drain = async { while join_set.join_next().await.is_some() {} };
            if tokio::time::timeout(self.config.cancel_grace, drain).await.is_err() {
                error!("Workers did not stop, aborting them");
                join_set.abort_all();
            }
        }

        info!("Render scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            concurrency: self.config.concurrency,
            queue_depth: self.queue_depth(),
            running: self.running_count(),
            outstanding: self.store.outstanding(),
            max_jobs: self.store.config().max_jobs,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}
