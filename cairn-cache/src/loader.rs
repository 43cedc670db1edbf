//! Network loader contract.

use std::future::Future;

use async_trait::async_trait;
use cairn_core::CairnResult;

/// Fetches a fresh value for an id from the rate-limited remote source.
///
/// The coordinator guarantees at most one outstanding call per id, so
/// implementations do not need their own deduplication. `force` is passed
/// through so the loader can skip any upstream caching of its own.
#[async_trait]
pub trait NetworkLoader<V>: Send + Sync {
    async fn load(&self, id: &str, force: bool) -> CairnResult<V>;
}

/// Loader backed by an async closure.
///
/// Built with [`loader_fn`].
pub struct FnLoader<F> {
    func: F,
}

/// Adapt an async closure into a [`NetworkLoader`].
///
/// ```ignore
/// let loader = loader_fn(|id: String, _force: bool| async move {
///     client.fetch_hero(&id).await
/// });
/// ```
pub fn loader_fn<F>(func: F) -> FnLoader<F> {
    FnLoader { func }
}

#[async_trait]
impl<V, F, Fut> NetworkLoader<V> for FnLoader<F>
where
    F: Fn(String, bool) -> Fut + Send + Sync,
    Fut: Future<Output = CairnResult<V>> + Send,
    V: Send + 'static,
{
    async fn load(&self, id: &str, force: bool) -> CairnResult<V> {
        (self.func)(id.to_string(), force).await
    }
}
