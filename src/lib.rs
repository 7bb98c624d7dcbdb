//! jan_gateway — OpenAI-compatible LLM inference gateway.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod cache;
pub mod config;
pub mod control;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod registry;
pub mod responses;
pub mod router;
pub mod store;
pub mod stream;
pub mod utils;

/// Return the gateway home directory.
///
/// Resolution order:
/// 1. `JAN_GATEWAY_HOME` environment variable
/// 2. `$HOME/.jan-gateway`
pub fn gateway_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("JAN_GATEWAY_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".jan-gateway")
    }
}
