use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

/// What a [BatchLoader] hands back for a set of keys.
///
/// A loader is expected to return a future resolving to one update or a list
/// of updates. [LoaderResult::Immediate] exists so that a loader producing a
/// plain value can be rejected rather than silently accepted.
pub enum LoaderResult {
    Deferred(BoxFuture<'static, anyhow::Result<Value>>),
    Immediate(Value),
}

impl LoaderResult {
    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    /// A future that is already resolved with `value`.
    pub fn resolved(value: Value) -> Self {
        Self::deferred(async move { Ok(value) })
    }

    pub fn immediate(value: Value) -> Self {
        Self::Immediate(value)
    }
}

/// Fetches the data for keys missing from the store.
///
/// Only called with the keys the selector could not resolve, never with an
/// empty slice.
pub trait BatchLoader<K>: Send + Sync + 'static {
    fn load(&self, keys: &[K]) -> LoaderResult;
}

impl<K, F> BatchLoader<K> for F
where
    F: Fn(&[K]) -> LoaderResult + Send + Sync + 'static,
{
    fn load(&self, keys: &[K]) -> LoaderResult {
        self(keys)
    }
}
