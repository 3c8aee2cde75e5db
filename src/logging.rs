//! Tracing subscriber setup for the binary. Library code only emits events.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber writing to stderr, so stdout stays free for deltas.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this twice is a no-op.
pub fn init(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        tracing::debug!("tracing subscriber already installed: {e}");
    }
}
