use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn,replay=info,client_core=info";

/// Installs the global subscriber.
///
/// The filter comes from `RUST_LOG`, else `CHAT_REPLAY_LOG`, else the
/// built-in default. Logs go to stderr so stdout stays a clean snapshot.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if let Some(value) = env::var("CHAT_REPLAY_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        if let Ok(filter) = EnvFilter::try_new(value) {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
