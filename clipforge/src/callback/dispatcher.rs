//! Completion callback delivery.
//!
//! Each terminal job with a callback URL gets one signed POST, delivered from
//! a detached task with its own timeout. Outcomes are logged; nothing is
//! retried and redirects are not followed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::allowlist::CallbackPolicy;
use super::signer::CallbackSigner;
use crate::domain::{Job, JobStatus, output_url};
use crate::{Error, Result};

pub const SIGNATURE_HEADER: &str = "x-clipforge-signature";
pub const EVENT_HEADER: &str = "x-clipforge-event";
pub const DELIVERY_HEADER: &str = "x-clipforge-delivery";

/// Body of a completion callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackPayload {
    pub fn from_job(job: &Job, base_url: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            output_url: job
                .output_ref
                .as_deref()
                .and_then(|path| output_url(base_url, path)),
            error: job.error.clone(),
        }
    }

    /// Value of the event header.
    pub fn event(&self) -> &'static str {
        match self.status {
            JobStatus::Completed => "render.completed",
            JobStatus::Failed => "render.failed",
            JobStatus::Cancelled => "render.cancelled",
            JobStatus::Pending | JobStatus::Running => "render.updated",
        }
    }
}

/// Callback dispatcher configuration.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub timeout: Duration,
    /// Base URL used to build `output_url`.
    pub public_base_url: String,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            public_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallbackStats {
    pub delivered: u64,
    pub failed: u64,
}

/// Sends completion callbacks.
pub struct CallbackDispatcher {
    config: CallbackConfig,
    policy: Arc<CallbackPolicy>,
    signer: Option<CallbackSigner>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl CallbackDispatcher {
    pub fn new(
        config: CallbackConfig,
        policy: Arc<CallbackPolicy>,
        signer: Option<CallbackSigner>,
    ) -> Self {
        if signer.is_none() {
            warn!("No callback secret configured, callbacks will be sent unsigned");
        }
        Self {
            config,
            policy,
            signer,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &Arc<CallbackPolicy> {
        &self.policy
    }

    /// Deliver the callback for a terminal job in the background.
    ///
    /// Returns `None` when the job has no callback URL.
    pub fn notify(self: &Arc<Self>, job: &Job) -> Option<JoinHandle<()>> {
        let url = job.spec.callback.clone()?;
        let payload = CallbackPayload::from_job(job, &self.config.public_base_url);
        let dispatcher = self.clone();

        Some(tokio::spawn(async move {
            match dispatcher.deliver(&url, &payload).await {
                Ok(status) => {
                    dispatcher.delivered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        job_id = %payload.job_id,
                        status = %status,
                        "Callback delivered"
                    );
                }
                Err(e) => {
                    dispatcher.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(job_id = %payload.job_id, url = %url, error = %e, "Callback delivery failed");
                }
            }
        }))
    }

    fn build_headers(&self, body: &[u8], payload: &CallbackPayload) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("clipforge/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(EVENT_HEADER, HeaderValue::from_static(payload.event()));

        let delivery = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&delivery) {
            headers.insert(DELIVERY_HEADER, value);
        }

        if let Some(signer) = &self.signer
            && let Ok(value) = HeaderValue::from_str(&signer.sign(body))
        {
            headers.insert(SIGNATURE_HEADER, value);
        }

        headers
    }

    /// Deliver one callback now.
    ///
    /// The destination is validated again right before sending and the
    /// connection is pinned to the addresses that passed validation. The
    /// configured timeout bounds validation and the request together.
    pub async fn deliver(&self, url: &Url, payload: &CallbackPayload) -> Result<StatusCode> {
        tokio::time::timeout(self.config.timeout, self.send(url, payload))
            .await
            .map_err(|_| {
                Error::Delivery(format!(
                    "timed out after {} ms",
                    self.config.timeout.as_millis()
                ))
            })?
    }

    async fn send(&self, url: &Url, payload: &CallbackPayload) -> Result<StatusCode> {
        let target = self
            .policy
            .validate(url)
            .await
            .map_err(|e| Error::Delivery(e.to_string()))?;

        let mut builder = Client::builder()
            .timeout(self.config.timeout)
            .redirect(reqwest::redirect::Policy::none());
        if let Some(domain) = &target.domain
            && !target.addrs.is_empty()
        {
            builder = builder.resolve_to_addrs(domain, &target.addrs);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Delivery(format!("failed to build HTTP client: {e}")))?;

        let body = serde_json::to_vec(payload)?;
        let headers = self.build_headers(&body, payload);

        debug!(job_id = %payload.job_id, url = %url, "Sending callback");
        let response = client
            .post(target.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Delivery(format!("destination responded {status}")));
        }
        Ok(status)
    }

    pub fn stats(&self) -> CallbackStats {
        CallbackStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
