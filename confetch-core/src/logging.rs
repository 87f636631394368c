use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide tracing subscriber. A `RUST_LOG`
/// directive takes precedence; otherwise everything logs at
/// `default_level`. Output goes to stderr so tools that print config
/// data on stdout stay pipeable.
pub fn init_tracing(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
