use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the process-wide subscriber: `RUST_LOG`-style filtering with an
/// `info` default. Safe to call more than once; a subscriber installed
/// elsewhere (for example by a test harness) wins.
pub fn init() {
    INIT.get_or_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false));
        let _ = subscriber.try_init();
    });
}
