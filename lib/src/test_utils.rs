use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Opt-in test logging, controlled with `RUST_LOG`.
pub(crate) fn init_log() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}
