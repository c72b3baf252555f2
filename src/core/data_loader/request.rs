use super::registry::LoaderIdentity;
use crate::core::{Error, Result};

/// A request for the value of one key, bound to the loader that serves it.
///
/// Submit it with [Loaders::request](super::Loaders::request).
pub struct Request<K, V> {
    identity: LoaderIdentity<K, V>,
    key: K,
}

impl<K, V> Request<K, V> {
    pub fn identity(&self) -> LoaderIdentity<K, V> {
        self.identity
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn into_parts(self) -> (LoaderIdentity<K, V>, K) {
        (self.identity, self.key)
    }
}

/// Builds [Request]s for a single loader.
pub struct RequestFactory<K, V> {
    identity: LoaderIdentity<K, V>,
}

impl<K, V> RequestFactory<K, V> {
    pub(crate) fn new(identity: LoaderIdentity<K, V>) -> Self {
        Self { identity }
    }

    pub fn key(&self, key: K) -> Request<K, V> {
        Request { identity: self.identity, key }
    }

    /// Builds a request from an argument list, which must hold exactly one
    /// key.
    pub fn args<I: IntoIterator<Item = K>>(&self, args: I) -> Result<Request<K, V>> {
        let mut args = args.into_iter();
        match (args.next(), args.next()) {
            (Some(key), None) => Ok(self.key(key)),
            (None, _) => Err(Error::SingleArgumentOnly { given: 0 }),
            (Some(_), Some(_)) => Err(Error::SingleArgumentOnly { given: 2 + args.count() }),
        }
    }
}

impl<K, V> Clone for RequestFactory<K, V> {
    fn clone(&self) -> Self {
        Self { identity: self.identity }
    }
}
