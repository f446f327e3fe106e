//! Logging setup for the binary and tests.

use tracing::Level;

/// Installs a `tracing-subscriber` formatter at `level`.
///
/// Unknown level names fall back to `info`. Safe to call more than once;
/// later calls leave the first subscriber in place.
pub fn init(level: &str) {
    let level = match level.to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
