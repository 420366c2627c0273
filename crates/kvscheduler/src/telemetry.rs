//! Tracing initialisation for binaries embedding the scheduler.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored,
//! since the global subscriber can only be set once per process.
//!
//! The filter comes from `KVS_LOG`, then `RUST_LOG`. Without either, the
//! scheduler and the embedding application log at the requested level while
//! every other crate is held at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read before `RUST_LOG`.
pub const LOG_ENV: &str = "KVS_LOG";

/// Default filter directives: `level` for the scheduler and `app_target`,
/// at most `warn` for everything else.
pub fn default_directives(level: Level, app_target: &str) -> String {
    let others = level.min(Level::WARN);
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = format!(
        "{},{}={}",
        others.as_str().to_ascii_lowercase(),
        env!("CARGO_CRATE_NAME"),
        level
    );
    if !app_target.is_empty() && app_target != env!("CARGO_CRATE_NAME") {
        directives.push_str(&format!(",{app_target}={level}"));
    }
    directives
}

fn env_filter(level: Level, app_target: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level, app_target)))
}

/// Install the global subscriber.
///
/// * `json` - emit newline-delimited JSON instead of human-readable lines.
/// * `level` - verbosity of the scheduler and of `app_target` (usually the
///   caller's `env!("CARGO_CRATE_NAME")`) when no filter is set.
pub fn init_tracing(json: bool, level: Level, app_target: &str) {
    let registry = tracing_subscriber::registry().with(env_filter(level, app_target));
    if json {
        registry
            .with(fmt::layer().with_target(true).json())
            .try_init()
            .ok();
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .ok();
    }
}
