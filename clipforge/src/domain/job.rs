//! Render job record and its lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::RenderSpec;

/// Job status.
///
/// Transitions are one-directional: `Pending -> Running -> {Completed, Failed,
/// Cancelled}`, and `Pending -> Cancelled` for jobs cancelled before a worker
/// picked them up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Admitted and waiting for a worker.
    Pending,
    /// Owned by a worker.
    Running,
    /// Render finished and an output artifact exists.
    Completed,
    /// Compile, render or timeout failure.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A render job.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
    /// Validated request this job renders.
    pub spec: Arc<RenderSpec>,
    /// Render progress in `[0.0, 1.0]`.
    pub progress: f32,
    /// Output artifact path, set only on `Completed`.
    pub output_ref: Option<PathBuf>,
    /// Error message, set on `Failed` and `Cancelled`.
    pub error: Option<String>,
    /// When the job was admitted.
    pub created_at: DateTime<Utc>,
    /// Last mutation of any field.
    pub updated_at: DateTime<Utc>,
    /// When a worker picked the job up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(spec: RenderSpec) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            spec: Arc::new(spec),
            progress: 0.0,
            output_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Override the job ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time spent waiting in the queue before a worker started it.
    pub fn queue_wait(&self) -> Option<chrono::Duration> {
        self.started_at.map(|started| started - self.created_at)
    }
}

/// Public URL of an output artifact: `{base_url}/outputs/{file_name}`.
pub fn output_url(base_url: &str, output: &Path) -> Option<String> {
    let file_name = output.file_name()?.to_str()?;
    Some(format!("{}/outputs/{file_name}", base_url.trim_end_matches('/')))
}

/// Terminal outcome recorded by a worker.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { output: PathBuf },
    Failed { error: String },
    Cancelled { reason: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled { .. } => JobStatus::Cancelled,
        }
    }
}
