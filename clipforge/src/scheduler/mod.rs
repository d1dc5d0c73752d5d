//! Job scheduling: the job store, the worker pool, the executor and the
//! garbage collector.

pub mod executor;
pub mod gc;
pub mod job_store;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use executor::{Executor, ExecutorConfig};
pub use gc::{GarbageCollector, GcConfig};
pub use job_store::{CancelOutcome, JobStore, JobStoreConfig, JobStoreStats, SweepReport};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
