//! Tracing and logging setup shared by binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide logging for the deployment environment `env`.
///
/// `"development"` gets human-readable output; anything else gets JSON.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init(env: &str) {
    self::tracing::init(LogFormat::for_env(env));
}
