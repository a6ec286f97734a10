use tracing_subscriber::EnvFilter;

/// Diagnostics go to stderr so stdout stays report-only.
pub fn init_logging(default_filter: &str, env_key: &str) {
    let env_filter = EnvFilter::try_from_env(env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
