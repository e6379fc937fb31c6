use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the given default level applies.
pub fn init(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}
