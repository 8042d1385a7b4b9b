//! Logging setup shared by every binary

use tracing_subscriber::EnvFilter;

/// Selects the JSON formatter when set to `json`
pub const LOG_FORMAT: &str = "EDGE_LOG_FORMAT";

/// Install the global subscriber
///
/// `RUST_LOG` controls filtering and defaults to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json_format() {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn json_format() -> bool {
    std::env::var(LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
