//! Diagnostic logging setup.
//!
//! Events go to stderr through `tracing-subscriber`; command output stays on
//! stdout. `RUST_LOG` wins when set, otherwise `-v` flags pick the level.

use tracing_subscriber::{fmt, EnvFilter};

/// Level used when neither `RUST_LOG` nor `-v` is given.
const DEFAULT_LEVEL: &str = "info";

fn level_for(verbose: u8) -> &'static str {
    match verbose {
        0 => DEFAULT_LEVEL,
        1 => "debug",
        _ => "trace",
    }
}

fn filter_for(verbose: u8, rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(level_for(verbose)))
}

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init(verbose: u8) {
    let _ = fmt()
        .with_env_filter(filter_for(verbose, std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .try_init();
}
