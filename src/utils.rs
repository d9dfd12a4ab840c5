use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Installs the global subscriber: formatted events on stderr, progress bars
/// for spans, and a filter from `RUST_LOG` falling back to one picked by
/// `verbosity` (`0` warn, `1` info, more is debug).
pub fn init_logging(verbosity: u8) -> Result<(), TryInitError> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init()
}
