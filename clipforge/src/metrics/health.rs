//! Health check implementation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::callback::{CallbackDispatcher, CallbackStats};
use crate::compile::{CacheStats, CompileCache};
use crate::pool::{PoolStats, PoolStatus, ResourcePool};
use crate::scheduler::{JobStoreStats, Scheduler, SchedulerStats};

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component is unhealthy.
    Unhealthy,
    /// Component status is unknown.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Health status.
    pub status: HealthStatus,
    /// Optional message.
    pub message: Option<String>,
    /// Check duration in milliseconds.
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    /// Create a healthy component.
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            check_duration_ms: None,
        }
    }

    /// Create an unhealthy component.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            check_duration_ms: None,
        }
    }

    /// Create a degraded component.
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            check_duration_ms: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the check duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Full health report.
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    /// Overall status: the worst component status.
    pub status: HealthStatus,
    /// Whether new render jobs are currently accepted.
    pub ready: bool,
    pub version: String,
    pub uptime_secs: u64,
    /// Timestamp of the health check (RFC 3339).
    pub timestamp: String,
    pub components: BTreeMap<String, ComponentHealth>,
    pub scheduler: SchedulerStats,
    pub jobs: JobStoreStats,
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub callbacks: CallbackStats,
}

impl EngineHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Builds health reports from the running engine.
pub struct HealthChecker {
    scheduler: Arc<Scheduler>,
    cache: Arc<CompileCache>,
    pool: Arc<ResourcePool>,
    dispatcher: Arc<CallbackDispatcher>,
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        cache: Arc<CompileCache>,
        pool: Arc<ResourcePool>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            scheduler,
            cache,
            pool,
            dispatcher,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Liveness: the process is up and the scheduler has not been stopped.
    pub fn check_live(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Readiness: the scheduler runs and admission is not saturated.
    pub fn check_ready(&self) -> bool {
        self.scheduler.is_running() && !self.scheduler.store().is_saturated()
    }

    /// Run all checks.
    pub fn check_all(&self) -> EngineHealth {
        let started = Instant::now();
        let scheduler = self.scheduler.stats();
        let jobs = self.scheduler.store().stats();
        let cache = self.cache.stats();
        let pool = self.pool.stats();
        let callbacks = self.dispatcher.stats();

        let mut components = BTreeMap::new();
        for component in [
            scheduler_health(self.scheduler.is_running(), &scheduler),
            pool_health(&pool),
            cache_health(&cache),
            callback_health(&callbacks),
        ] {
            components.insert(
                component.name.clone(),
                component.with_duration(started.elapsed()),
            );
        }

        let status = components
            .values()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, worst);

        EngineHealth {
            status,
            ready: self.check_ready(),
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            components,
            scheduler,
            jobs,
            cache,
            pool,
            callbacks,
        }
    }
}

fn worst(current: HealthStatus, next: HealthStatus) -> HealthStatus {
    match (current, next) {
        (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
        (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
        (HealthStatus::Unknown, _) | (_, HealthStatus::Unknown) => HealthStatus::Unknown,
        _ => HealthStatus::Healthy,
    }
}

fn scheduler_health(running: bool, stats: &SchedulerStats) -> ComponentHealth {
    if !running {
        return ComponentHealth::unhealthy("scheduler", "scheduler is stopped");
    }
    if stats.outstanding >= stats.max_jobs {
        return ComponentHealth::degraded(
            "scheduler",
            format!("at capacity: {} of {} jobs outstanding", stats.outstanding, stats.max_jobs),
        );
    }
    ComponentHealth::healthy("scheduler").with_message(format!(
        "{} running, {} queued",
        stats.running, stats.queue_depth
    ))
}

fn pool_health(stats: &PoolStats) -> ComponentHealth {
    // A pool that keeps failing to launch without ever succeeding cannot render.
    if stats.status == PoolStatus::Empty && stats.launch_failures > 0 && stats.launches == 0 {
        return ComponentHealth::degraded(
            "engine",
            format!("{} failed launch attempts", stats.launch_failures),
        );
    }
    let state = match stats.status {
        PoolStatus::Empty => "idle",
        PoolStatus::Launching => "launching",
        PoolStatus::Ready => "ready",
    };
    ComponentHealth::healthy("engine").with_message(state)
}

fn cache_health(stats: &CacheStats) -> ComponentHealth {
    ComponentHealth::healthy("compile_cache").with_message(format!(
        "{} of {} entries",
        stats.entries, stats.capacity
    ))
}

fn callback_health(stats: &CallbackStats) -> ComponentHealth {
    if stats.failed > 0 && stats.delivered == 0 {
        return ComponentHealth::degraded(
            "callbacks",
            format!("{} deliveries failed, none succeeded", stats.failed),
        );
    }
    ComponentHealth::healthy("callbacks")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_status_wins() {
        use HealthStatus::*;
        assert_eq!(worst(Healthy, Healthy), Healthy);
        assert_eq!(worst(Healthy, Degraded), Degraded);
        assert_eq!(worst(Degraded, Unhealthy), Unhealthy);
        assert_eq!(worst(Unhealthy, Healthy), Unhealthy);
    }

    #[test]
    fn saturated_scheduler_is_degraded() {
        let stats = SchedulerStats {
            concurrency: 1,
            queue_depth: 2,
            running: 1,
            outstanding: 3,
            max_jobs: 3,
            uptime_secs: 10,
        };
        assert_eq!(scheduler_health(true, &stats).status, HealthStatus::Degraded);
        assert_eq!(scheduler_health(false, &stats).status, HealthStatus::Unhealthy);

        let idle = SchedulerStats {
            outstanding: 0,
            queue_depth: 0,
            running: 0,
            ..stats
        };
        assert_eq!(scheduler_health(true, &idle).status, HealthStatus::Healthy);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(HealthStatus::Unknown.to_string(), "unknown");
    }
}
