use crate::cache::FetchError;

/// Receives failed refreshes from entries that have failure logging enabled.
pub trait FailureObserver: Send + Sync {
    fn on_failure(&self, key: &str, error: &FetchError, has_stale_value: bool);
}

/// Default observer: one `warn` event per failed refresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FailureObserver for TracingObserver {
    fn on_failure(&self, key: &str, error: &FetchError, has_stale_value: bool) {
        tracing::warn!(
            key,
            error = %error,
            serving_stale = has_stale_value,
            "Cache refresh failed"
        );
    }
}
