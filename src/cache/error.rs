use thiserror::Error;

/// Why a fetch function could not produce a value.
///
/// Stored on the entry as its last error, so it has to be cheap to clone and
/// must not borrow from the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("fetch aborted: {0}")]
    Aborted(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry '{key}' is already registered: {reason}")]
    Conflict { key: String, reason: String },

    #[error("no cache entry registered for '{0}'")]
    UnknownKey(String),

    #[error("no tokio runtime available to run refreshes")]
    NoRuntime,
}
