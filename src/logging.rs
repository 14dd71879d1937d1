use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Safe to call more than once; the
/// second call returns an error which callers may ignore with `.ok()`.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
}
