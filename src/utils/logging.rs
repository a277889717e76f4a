use tracing_subscriber::EnvFilter;

/// Environment variable holding a full filter directive, e.g.
/// `POPMESH_LOG=popmesh::broker=debug`. Overrides the configured level.
pub const LOG_ENV: &str = "POPMESH_LOG";

/// Initialize tracing/logging for the application.
///
/// Accepts the verbosity strings used in configuration (`DEBUG`, `INFO`,
/// `WARN`, `ERR`, `FATAL`), case-insensitively. `FATAL` has no tracing
/// counterpart and maps to `ERROR`.
pub fn init(default_level: &str) {
    let lvl = parse_level(default_level);
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(lvl.as_str().to_lowercase()));

    // try_init so tests and embedding applications can call this repeatedly
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "err" | "error" | "fatal" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}
