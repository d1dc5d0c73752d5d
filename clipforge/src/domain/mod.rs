//! Domain types shared by the scheduler, executor and API.

pub mod job;
pub mod request;

pub use job::{Job, JobOutcome, JobStatus, output_url};
pub use request::{
    ClipRef, Composition, OutputGeometry, RenderParams, RenderRequest, RenderSpec, RequestLimits,
};
