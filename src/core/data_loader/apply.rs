use std::fmt::Debug;

use serde_json::Value;

use super::loader::LoaderResult;
use crate::core::store::{Store, Update};
use crate::core::{Error, Result};

/// Turns a resolved loader value into the updates it carries.
///
/// A lone update counts as a list of one. Every element is checked before any
/// of them is handed to the store.
pub(crate) fn normalize(value: Value) -> Result<Vec<Update>> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| Update::try_from(item).map_err(|_| Error::NotAnUpdate { index }))
            .collect(),
        value => Update::try_from(value)
            .map(|update| vec![update])
            .map_err(|_| Error::MalformedLoaderResult),
    }
}

/// Awaits the loader, applies its updates in order and checks that every
/// `missing` key can now be selected.
pub(crate) async fn validate_and_apply<S, K, V>(
    store: &S,
    select: impl Fn(&K, &S::State) -> Option<V>,
    result: LoaderResult,
    missing: &[K],
) -> Result<()>
where
    S: Store,
    K: Debug,
{
    let future = match result {
        LoaderResult::Deferred(future) => future,
        LoaderResult::Immediate(_) => return Err(Error::NotAwaitable),
    };

    let updates = normalize(future.await.map_err(Error::Loader)?)?;
    tracing::debug!(updates = updates.len(), "applying loader result");

    for update in updates {
        store.dispatch(update).await.map_err(Error::Dispatch)?;
    }

    let state = store.get_state();
    match missing.iter().find(|key| select(*key, &*state).is_none()) {
        Some(key) => Err(Error::WriteFailed { key: format!("{:?}", key) }),
        None => Ok(()),
    }
}
