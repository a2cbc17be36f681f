/// Opt-in tracing setup for tests and demo harnesses.
///
/// Installs a fmt subscriber driven by the `RUST_LOG` environment variable.
/// Does nothing when the variable is unset, and tolerates a subscriber
/// already being installed, so tests can call it unconditionally.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
