//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the log format (`json` or anything else for compact).
pub const LOG_FORMAT_ENV: &str = "FNGATE_LOG_FORMAT";

/// Whether the environment asks for JSON logs.
pub fn json_requested_by_env() -> bool {
    std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialize tracing subscriber once for the process.
///
/// Filter defaults to `info` if `RUST_LOG` is unset. `json` switches the fmt
/// layer to JSON lines; otherwise the compact formatter is used.
pub fn init_tracing(json: bool) {
    TRACING_INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

// Tests live in tests/observability.rs: `init_tracing` installs a process-global
// subscriber, which would collide with `#[traced_test]` in the lib test binary.
