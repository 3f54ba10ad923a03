//! Tracing subscriber setup.
//!
//! Logs go to stderr so command output on stdout stays machine-readable.
//! `GT_LOG` (or `RUST_LOG`) sets the filter; `GT_LOG_FORMAT=json` switches to
//! one JSON object per event.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "warn";

/// Keeps the subscriber alive for the life of `main`.
pub struct TelemetryGuard {
    _private: (),
}

/// Install the global tracing subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() -> TelemetryGuard {
    let filter = std::env::var("GT_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("GT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .compact()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
    // Already initialized (tests, embedding): keep the existing subscriber.
    let _ = result;

    TelemetryGuard { _private: () }
}
