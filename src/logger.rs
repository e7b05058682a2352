//! Centralized logging configuration for ba-covariance tools and tests
//!
//! The library itself only emits `tracing` events. Executables and test harnesses
//! call [`init_logger`] once to route them to stdout.

use tracing::Level;

/// Initialize the tracing subscriber with the default INFO level
///
/// Override the level with the `RUST_LOG` environment variable:
/// ```bash
/// RUST_LOG=ba_covariance=debug cargo test
/// ```
///
/// # Example
/// ```no_run
/// use ba_covariance::init_logger;
///
/// init_logger();
/// tracing::info!("Covariance estimation started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// Repeated calls are harmless: once a global subscriber is installed, further
/// initialization attempts are ignored.
///
/// # Arguments
/// * `default_level` - The default log level (overrideable via RUST_LOG)
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}
