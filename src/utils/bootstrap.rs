//! Process bootstrap helpers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV: &str = "EVENTLINE_LOG";

/// Initialize tracing with the EVENTLINE_LOG environment variable.
///
/// Defaults to "info" level if EVENTLINE_LOG is not set. Safe to call more
/// than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
