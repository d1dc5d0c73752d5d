//! Signed, SSRF-guarded completion callbacks.

pub mod allowlist;
pub mod dispatcher;
pub mod signer;

pub use allowlist::{CallbackPolicy, CallbackTarget, HostResolver, SystemResolver};
pub use dispatcher::{CallbackConfig, CallbackDispatcher, CallbackPayload, CallbackStats};
pub use signer::CallbackSigner;
