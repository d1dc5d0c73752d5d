//! HTTP API.
//!
//! - `POST /render`, `GET /render/{id}`, `DELETE /render/{id}` (API key protected)
//! - `GET /health`, `/health/live`, `/health/ready`
//! - `GET /outputs/{file}` serves rendered outputs

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
