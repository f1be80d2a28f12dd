use tracing_subscriber::EnvFilter;

pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Installs a JSON formatter for test binaries. `RUST_LOG` wins over
/// `default_level`. Fails if a global subscriber is already set.
pub fn init(default_level: &str) -> Result<(), InitError> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_test_writer()
        .try_init()
}
