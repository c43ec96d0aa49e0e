//! Process-wide tracing setup shared by binaries, benches and integration tests.

/// Initialize tracing with the settings from the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::TracingConfig::from_env());
}

/// Subscriber configuration and installation.
pub mod tracing;
