//! clipforge library crate.
//!
//! A render job engine: callers submit render requests over HTTP, jobs are
//! scheduled onto a bounded worker pool, compositions are compiled once and
//! cached, renders share one long-lived engine, and completion is reported
//! through signed, SSRF-guarded callbacks.

pub mod api;
pub mod backend;
pub mod callback;
pub mod compile;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use error::{Error, Result};
