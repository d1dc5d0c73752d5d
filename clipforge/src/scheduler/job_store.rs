//! In-memory job store.
//!
//! Authoritative map of job id to job record, plus the admission counter and
//! the output registry swept by the garbage collector.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Job, JobOutcome, JobStatus, RenderSpec};
use crate::utils::fs;
use crate::{Error, Result};

/// Job store configuration.
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// Maximum number of pending plus running jobs.
    pub max_jobs: usize,
    /// Records are removed once `now - updated_at` exceeds this.
    pub job_ttl: Duration,
    /// Outputs are removed once `now - completed_at` exceeds this.
    pub output_ttl: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            max_jobs: 20,
            job_ttl: Duration::from_secs(3600),
            output_ttl: Duration::from_secs(86400),
        }
    }
}

/// An output artifact tracked independently of its job record.
#[derive(Debug, Clone)]
struct OutputRecord {
    path: PathBuf,
    completed_at: DateTime<Utc>,
}

/// Result of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled(Job),
    /// The job is running; its token was cancelled and it will stop shortly.
    Cancelling(Job),
}

impl CancelOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CancelOutcome::Cancelled(job) | CancelOutcome::Cancelling(job) => job,
        }
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub records_removed: usize,
    /// Non-terminal records removed; their renders were cancelled.
    pub abandoned: usize,
    pub outputs_removed: usize,
    /// Output files that could not be removed; retried next sweep.
    pub output_failures: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.records_removed == 0 && self.outputs_removed == 0 && self.output_failures.is_empty()
    }
}

/// Counts by status.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStoreStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub outstanding: usize,
    pub max_jobs: usize,
    pub tracked_outputs: usize,
}

fn ttl_delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX)
}

/// Concurrent job store.
pub struct JobStore {
    config: JobStoreConfig,
    jobs: DashMap<String, Job>,
    tokens: DashMap<String, CancellationToken>,
    /// Jobs currently holding an admission slot.
    slots: DashSet<String>,
    outputs: DashMap<String, OutputRecord>,
    outstanding: AtomicUsize,
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            config,
            jobs: DashMap::new(),
            tokens: DashMap::new(),
            slots: DashSet::new(),
            outputs: DashMap::new(),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &JobStoreConfig {
        &self.config
    }

    /// Admit a new pending job, or fail with `Error::Capacity`.
    pub fn create(&self, spec: RenderSpec) -> Result<Job> {
        let max = self.config.max_jobs;
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|outstanding| Error::Capacity { outstanding, max })?;

        let job = Job::new(spec);
        self.slots.insert(job.id.clone());
        self.tokens.insert(job.id.clone(), CancellationToken::new());
        self.jobs.insert(job.id.clone(), job.clone());

        debug!(job_id = %job.id, "Job admitted");
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|job| job.clone())
    }

    pub fn cancellation_token(&self, id: &str) -> Option<CancellationToken> {
        self.tokens.get(id).map(|token| token.clone())
    }

    fn release_slot(&self, id: &str) {
        if self.slots.remove(id).is_some() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Move a pending job to `Running`. Fails if it is no longer pending.
    pub fn mark_running(&self, id: &str) -> Result<Job> {
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))?;

        if !job.status.can_transition_to(JobStatus::Running) {
            return Err(Error::InvalidStateTransition {
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }

        let now = Utc::now();
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(job.clone())
    }

    /// Record render progress. Ignored unless the job is running; progress
    /// never moves backwards.
    pub fn update_progress(&self, id: &str, fraction: f32) {
        if !fraction.is_finite() {
            return;
        }
        if let Some(mut job) = self.jobs.get_mut(id)
            && job.status == JobStatus::Running
        {
            let fraction = fraction.clamp(0.0, 1.0);
            if fraction > job.progress {
                job.progress = fraction;
                job.updated_at = Utc::now();
            }
        }
    }

    /// Record a terminal outcome and release the job's admission slot.
    pub fn finish(&self, id: &str, outcome: JobOutcome) -> Result<Job> {
        let next = outcome.status();
        let job = {
            let mut job = self
                .jobs
                .get_mut(id)
                .ok_or_else(|| Error::not_found("Job", id))?;

            if !job.status.can_transition_to(next) {
                return Err(Error::InvalidStateTransition {
                    from: job.status.to_string(),
                    to: next.to_string(),
                });
            }

            let now = Utc::now();
            job.status = next;
            job.updated_at = now;
            job.completed_at = Some(now);
            match outcome {
                JobOutcome::Completed { output } => {
                    job.progress = 1.0;
                    job.output_ref = Some(output.clone());
                    self.outputs.insert(
                        id.to_string(),
                        OutputRecord {
                            path: output,
                            completed_at: now,
                        },
                    );
                }
                JobOutcome::Failed { error } | JobOutcome::Cancelled { reason: error } => {
                    job.error = Some(error);
                }
            }
            job.clone()
        };

        self.tokens.remove(id);
        self.release_slot(id);
        Ok(job)
    }

    /// Cancel a job. Pending jobs are cancelled immediately; running jobs get
    /// their token cancelled and finish through their worker.
    pub fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        let status = self
            .jobs
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| Error::not_found("Job", id))?;

        match status {
            JobStatus::Pending => {
                match self.finish(
                    id,
                    JobOutcome::Cancelled {
                        reason: "cancelled before start".to_string(),
                    },
                ) {
                    Ok(job) => Ok(CancelOutcome::Cancelled(job)),
                    // Picked up by a worker in the meantime.
                    Err(Error::InvalidStateTransition { .. }) => self.cancel(id),
                    Err(e) => Err(e),
                }
            }
            JobStatus::Running => {
                if let Some(token) = self.cancellation_token(id) {
                    token.cancel();
                }
                let job = self.get(id).ok_or_else(|| Error::not_found("Job", id))?;
                Ok(CancelOutcome::Cancelling(job))
            }
            terminal => Err(Error::InvalidStateTransition {
                from: terminal.to_string(),
                to: JobStatus::Cancelled.to_string(),
            }),
        }
    }

    /// Cancel the tokens of every running job.
    pub fn cancel_running(&self) -> usize {
        let mut cancelled = 0;
        for job in self.jobs.iter().filter(|job| job.status == JobStatus::Running) {
            if let Some(token) = self.tokens.get(job.key()) {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Remove expired records and outputs.
    ///
    /// A record goes once `now - updated_at > job_ttl`. An output goes once
    /// `now - completed_at > output_ttl`, whether or not its record still
    /// exists. Removing a record that is not terminal cancels its render and
    /// frees its admission slot.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let job_ttl = ttl_delta(self.config.job_ttl);
        let output_ttl = ttl_delta(self.config.output_ttl);

        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|job| now - job.updated_at > job_ttl)
            .map(|job| job.key().clone())
            .collect();

        for id in expired {
            let Some((_, job)) = self.jobs.remove_if(&id, |_, job| now - job.updated_at > job_ttl)
            else {
                continue;
            };
            report.records_removed += 1;

            if !job.is_terminal() {
                report.abandoned += 1;
                warn!(job_id = %id, status = %job.status, "Sweeping a job that never finished");
                if let Some((_, token)) = self.tokens.remove(&id) {
                    token.cancel();
                }
                self.release_slot(&id);
            }
            self.tokens.remove(&id);
        }

        let stale: Vec<(String, PathBuf)> = self
            .outputs
            .iter()
            .filter(|record| now - record.completed_at > output_ttl)
            .map(|record| (record.key().clone(), record.path.clone()))
            .collect();

        for (id, path) in stale {
            match fs::remove_file_if_exists(&path).await {
                Ok(existed) => {
                    self.outputs.remove(&id);
                    report.outputs_removed += 1;
                    debug!(job_id = %id, path = %path.display(), existed, "Removed expired output");
                }
                Err(e) => {
                    report.output_failures.push(e.to_string());
                }
            }
        }

        if report.records_removed > 0 || report.outputs_removed > 0 {
            info!(
                records = report.records_removed,
                outputs = report.outputs_removed,
                abandoned = report.abandoned,
                "Sweep completed"
            );
        }
        report
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_saturated(&self) -> bool {
        self.outstanding() >= self.config.max_jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn has_output(&self, id: &str) -> bool {
        self.outputs.contains_key(id)
    }

    pub fn stats(&self) -> JobStoreStats {
        let mut stats = JobStoreStats {
            outstanding: self.outstanding(),
            max_jobs: self.config.max_jobs,
            tracked_outputs: self.outputs.len(),
            ..Default::default()
        };

        for job in self.jobs.iter() {
            stats.total += 1;
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Composition, OutputGeometry, RenderParams};

    fn spec() -> RenderSpec {
        RenderSpec {
            composition: Composition::Template {
                name: "promo".to_string(),
            },
            geometry: OutputGeometry {
                width: 1080,
                height: 1920,
                fps: 30,
                duration_frames: 150,
            },
            params: RenderParams::default(),
            callback: None,
        }
    }

    fn store(max_jobs: usize) -> JobStore {
        JobStore::new(JobStoreConfig {
            max_jobs,
            job_ttl: Duration::from_secs(3600),
            output_ttl: Duration::from_secs(86400),
        })
    }

    #[test]
    fn admission_stops_at_max_jobs() {
        let store = store(2);
        store.create(spec()).unwrap();
        store.create(spec()).unwrap();

        match store.create(spec()) {
            Err(Error::Capacity { outstanding, max }) => {
                assert_eq!(outstanding, 2);
                assert_eq!(max, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn finishing_frees_exactly_one_slot() {
        let store = store(1);
        let job = store.create(spec()).unwrap();
        store.mark_running(&job.id).unwrap();
        store
            .finish(&job.id, JobOutcome::Failed { error: "boom".into() })
            .unwrap();
        assert_eq!(store.outstanding(), 0);

        // A second terminal write is rejected and does not double-release.
        assert!(store
            .finish(&job.id, JobOutcome::Cancelled { reason: "late".into() })
            .is_err());
        assert_eq!(store.outstanding(), 0);
        assert!(store.create(spec()).is_ok());
    }

    #[test]
    fn progress_is_monotonic_and_only_while_running() {
        let store = store(4);
        let job = store.create(spec()).unwrap();

        store.update_progress(&job.id, 0.5);
        assert_eq!(store.get(&job.id).unwrap().progress, 0.0);

        store.mark_running(&job.id).unwrap();
        store.update_progress(&job.id, 0.5);
        store.update_progress(&job.id, 0.3);
        store.update_progress(&job.id, f32::NAN);
        assert_eq!(store.get(&job.id).unwrap().progress, 0.5);

        store
            .finish(&job.id, JobOutcome::Completed { output: "/tmp/x.mp4".into() })
            .unwrap();
        let done = store.get(&job.id).unwrap();
        assert_eq!(done.progress, 1.0);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(store.has_output(&job.id));
    }

    #[test]
    fn cancel_pending_running_and_terminal() {
        let store = store(4);

        let pending = store.create(spec()).unwrap();
        match store.cancel(&pending.id).unwrap() {
            CancelOutcome::Cancelled(job) => assert_eq!(job.status, JobStatus::Cancelled),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.mark_running(&pending.id).is_err());

        let running = store.create(spec()).unwrap();
        store.mark_running(&running.id).unwrap();
        let token = store.cancellation_token(&running.id).unwrap();
        assert!(matches!(
            store.cancel(&running.id).unwrap(),
            CancelOutcome::Cancelling(_)
        ));
        assert!(token.is_cancelled());

        assert!(matches!(
            store.cancel(&pending.id),
            Err(Error::InvalidStateTransition { .. })
        ));
        assert!(matches!(store.cancel("missing"), Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn sweep_removes_records_by_updated_at() {
        let store = store(4);
        let job = store.create(spec()).unwrap();
        store.mark_running(&job.id).unwrap();
        store
            .finish(&job.id, JobOutcome::Failed { error: "boom".into() })
            .unwrap();
        let updated_at = store.get(&job.id).unwrap().updated_at;

        let exactly_ttl = updated_at + TimeDelta::seconds(3600);
        assert_eq!(store.sweep(exactly_ttl).await.records_removed, 0);
        assert!(store.get(&job.id).is_some());

        let past_ttl = exactly_ttl + TimeDelta::milliseconds(1);
        assert_eq!(store.sweep(past_ttl).await.records_removed, 1);
        assert!(store.get(&job.id).is_none());
    }

    #[tokio::test]
    async fn outputs_are_swept_independently_of_records() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("job.mp4");
        std::fs::write(&output, b"video").unwrap();

        let store = JobStore::new(JobStoreConfig {
            max_jobs: 4,
            job_ttl: Duration::from_secs(60),
            output_ttl: Duration::from_secs(3600),
        });
        let job = store.create(spec()).unwrap();
        store.mark_running(&job.id).unwrap();
        let done = store
            .finish(&job.id, JobOutcome::Completed { output: output.clone() })
            .unwrap();
        let completed_at = done.completed_at.unwrap();

        // Record expires first; the output survives it.
        let report = store.sweep(completed_at + TimeDelta::seconds(120)).await;
        assert_eq!(report.records_removed, 1);
        assert_eq!(report.outputs_removed, 0);
        assert!(output.exists());

        let report = store.sweep(completed_at + TimeDelta::seconds(3601)).await;
        assert_eq!(report.outputs_removed, 1);
        assert!(!output.exists());
        assert!(!store.has_output(&job.id));
    }

    #[tokio::test]
    async fn missing_output_file_is_not_an_error() {
        let store = store(4);
        let job = store.create(spec()).unwrap();
        store.mark_running(&job.id).unwrap();
        let done = store
            .finish(&job.id, JobOutcome::Completed { output: "/nonexistent/clipforge/x.mp4".into() })
            .unwrap();

        let report = store
            .sweep(done.completed_at.unwrap() + TimeDelta::days(2))
            .await;
        assert_eq!(report.outputs_removed, 1);
        assert!(report.output_failures.is_empty());
    }

    #[tokio::test]
    async fn sweeping_an_unfinished_job_cancels_it_and_frees_its_slot() {
        let store = store(1);
        let job = store.create(spec()).unwrap();
        store.mark_running(&job.id).unwrap();
        let token = store.cancellation_token(&job.id).unwrap();

        let report = store.sweep(Utc::now() + TimeDelta::hours(2)).await;
        assert_eq!(report.abandoned, 1);
        assert!(token.is_cancelled());
        assert_eq!(store.outstanding(), 0);
        assert!(store.create(spec()).is_ok());

        // The worker's late terminal write finds no record and frees nothing.
        assert!(store
            .finish(&job.id, JobOutcome::Failed { error: "late".into() })
            .is_err());
        assert_eq!(store.outstanding(), 1);
    }
}
