use shellwarden_config::{LogLevel, LoggingConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Install the stderr subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--log-level` overrides the configured
/// level for the configured targets.
pub(crate) fn initialize_tracing(cli_level: Option<LogLevel>, logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut logging = logging.clone();
        if let Some(level) = cli_level {
            logging.level = level;
        }
        EnvFilter::new(logging.filter_directive())
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let init_result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();

    if let Err(err) = init_result {
        tracing::warn!(error = %err, "tracing already initialized; skipping setup");
    }
}
