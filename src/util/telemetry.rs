//! Tracing bootstrap for embedding applications.

/// Install a default env-filtered fmt subscriber if the host application
/// has not set one up already. Safe to call more than once.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}
