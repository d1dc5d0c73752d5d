//! API middleware.

pub mod auth;

pub use auth::{ApiKeyAuth, api_key_auth};
