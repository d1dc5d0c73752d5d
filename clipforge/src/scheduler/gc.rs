//! Background garbage collector.
//!
//! Periodically sweeps the job store, removing expired job records and
//! output artifacts. A failing sweep is logged and retried on the next tick.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_store::{JobStore, SweepReport};
use crate::{Error, Result};

/// Garbage collector configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Interval between sweeps.
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl GcConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

pub struct GarbageCollector {
    config: GcConfig,
    store: Arc<JobStore>,
}

impl GarbageCollector {
    pub fn new(config: GcConfig, store: Arc<JobStore>) -> Self {
        Self { config, store }
    }

    /// Run a single sweep.
    ///
    /// Outputs that could not be deleted stay registered and turn the sweep
    /// into an error; everything else the sweep did still stands.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let report = self.store.sweep(Utc::now()).await;

        if !report.output_failures.is_empty() {
            return Err(Error::Sweep(format!(
                "{} output(s) could not be removed: {}",
                report.output_failures.len(),
                report.output_failures.join("; ")
            )));
        }
        Ok(report)
    }

    /// Start the background sweep task.
    pub fn start_background_task(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval_secs = self.config.interval.as_secs(),
                job_ttl_secs = self.store.config().job_ttl.as_secs(),
                output_ttl_secs = self.store.config().output_ttl.as_secs(),
                "Garbage collector started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Garbage collector shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) if !report.is_empty() => {
                                debug!(?report, "Sweep cycle completed");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!("Sweep cycle failed: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }
}
