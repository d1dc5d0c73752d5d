//! API request and response bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Job, JobStatus, output_url};

pub use crate::domain::RenderRequest;

/// `202 Accepted` body for `POST /render`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
}

impl From<&Job> for SubmitResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
        }
    }
}

/// Job as returned by `GET /render/{id}` and `DELETE /render/{id}`.
///
/// Failed and completed jobs share this shape; callers branch on `status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobResponse {
    pub fn from_job(job: &Job, base_url: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            output_url: job
                .output_ref
                .as_deref()
                .and_then(|output| output_url(base_url, output)),
            error: job.error.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
