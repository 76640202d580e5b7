use crate::cache::FetchError;
use async_trait::async_trait;
use std::future::Future;

/// The asynchronous operation an entry runs to produce a fresh value.
///
/// Any `Fn() -> impl Future<Output = Result<T, FetchError>>` closure implements
/// this, so most callers never name the trait directly.
#[async_trait]
pub trait Fetch<T>: Send + Sync {
    async fn fetch(&self) -> Result<T, FetchError>;
}

#[async_trait]
impl<T, F, Fut> Fetch<T> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    T: Send + 'static,
{
    async fn fetch(&self) -> Result<T, FetchError> {
        (self)().await
    }
}
