//! Logging setup.
//!
//! Components log through the `tracing` macros directly. Device ids go
//! through their truncated `Debug`; payloads and keys are never logged.

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO and above by default. Control the level with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug my-app
/// RUST_LOG=vitalsync_peer::orchestrator=trace my-app
/// ```
///
/// Calling this twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
