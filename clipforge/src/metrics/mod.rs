//! Health reporting.
//!
//! Aggregates scheduler, job store, compile cache, engine pool and callback
//! counters into the report served by `/health`, and answers the liveness and
//! readiness probes.

mod health;

pub use health::{ComponentHealth, EngineHealth, HealthChecker, HealthStatus};
