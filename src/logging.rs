//! Subscriber setup for the binaries.
//!
//! Library crates log through the `log` facade. With the `tracing-log`
//! feature, `try_init` also installs the `LogTracer` that forwards those
//! records into the subscriber. Output goes to stderr so stdout stays free
//! for command output and the bridge protocol.

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// `RUST_LOG` when set and valid, otherwise `default`.
pub fn log_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(default_filter: &str, json: bool) {
    let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(log_filter(default_filter))
        .with_writer(stderr)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    if result.is_err() {
        tracing::debug!("Logging already initialised");
    }
}
