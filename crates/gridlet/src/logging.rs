//! Tracing setup for the `gridlet` binary and embedders.
//!
//! Logs always go to stderr. A worker subprocess uses stdout for the line
//! protocol, and the coordinator keeps stdout for job output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level for the `gridlet` targets from a `GRIDLET_LOG` value.
fn level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = level(std::env::var("GRIDLET_LOG").ok().as_deref());
    EnvFilter::new(format!("gridlet={level}"))
}

/// Install the global subscriber. `RUST_LOG` wins over `GRIDLET_LOG`;
/// `LOG_FORMAT=json` emits JSON lines. Repeated calls are no-ops.
pub fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
