use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use derive_more::{Display, From};
use once_cell::sync::OnceCell;

use super::data_loader::DataLoader;
use super::dedupe::{Outcome, Pending};
use super::loader::BatchLoader;
use super::request::{Request, RequestFactory};
use crate::core::config::Batch;
use crate::core::counter::{AtomicCounter, Count};
use crate::core::store::Store;
use crate::core::{Error, Result};

/// Reads the value for a key out of a state snapshot.
pub type SelectFn<K, State, V> = Arc<dyn Fn(&K, &State) -> Option<V> + Send + Sync>;

static IDS: AtomicCounter = AtomicCounter::new(1);

/// Process-wide unique number of a registered loader.
#[derive(Clone, Copy, Debug, Display, From, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "loader#{}", _0)]
pub struct LoaderId(u64);

/// Typed handle to a (selector, batch loader) pair returned by
/// [Loaders::register].
pub struct LoaderIdentity<K, V> {
    id: LoaderId,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> LoaderIdentity<K, V> {
    fn next() -> Self {
        Self { id: LoaderId::from(IDS.next()), _marker: PhantomData }
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    /// Returns a constructor for requests against this loader.
    pub fn make_request(&self) -> RequestFactory<K, V> {
        RequestFactory::new(*self)
    }
}

impl<K, V> Clone for LoaderIdentity<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for LoaderIdentity<K, V> {}

impl<K, V> PartialEq for LoaderIdentity<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K, V> Eq for LoaderIdentity<K, V> {}

impl<K, V> Hash for LoaderIdentity<K, V> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<K, V> Debug for LoaderIdentity<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoaderIdentity").field(&self.id).finish()
    }
}

struct Registration<S: Store, K, V: Clone> {
    selector: SelectFn<K, S::State, V>,
    loader: Arc<dyn BatchLoader<K>>,
    batch: Batch,
    data_loader: OnceCell<DataLoader<S, K, V>>,
}

/// Owns the store and every loader registered against it.
///
/// Each registered loader gets its own [DataLoader], created on its first
/// request and reused from then on.
pub struct Loaders<S: Store> {
    store: Arc<S>,
    batch: Batch,
    registrations: DashMap<LoaderId, Arc<dyn Any + Send + Sync>>,
}

impl<S: Store> Loaders<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, batch: Batch::default(), registrations: DashMap::new() }
    }

    /// Sets the batching used by loaders registered without their own.
    #[must_use]
    pub fn with_batch(self, batch: Batch) -> Self {
        Self { batch, ..self }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn register<K, V, F, L>(&self, selector: F, loader: L) -> LoaderIdentity<K, V>
    where
        K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
        V: Send + Sync + Clone + 'static,
        F: Fn(&K, &S::State) -> Option<V> + Send + Sync + 'static,
        L: BatchLoader<K>,
    {
        self.register_with(selector, loader, self.batch.clone())
    }

    pub fn register_with<K, V, F, L>(
        &self,
        selector: F,
        loader: L,
        batch: Batch,
    ) -> LoaderIdentity<K, V>
    where
        K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
        V: Send + Sync + Clone + 'static,
        F: Fn(&K, &S::State) -> Option<V> + Send + Sync + 'static,
        L: BatchLoader<K>,
    {
        let identity = LoaderIdentity::next();
        let registration: Registration<S, K, V> = Registration {
            selector: Arc::new(selector),
            loader: Arc::new(loader),
            batch,
            data_loader: OnceCell::new(),
        };
        self.registrations.insert(identity.id, Arc::new(registration));
        tracing::debug!(loader = %identity.id, "registered loader");
        identity
    }

    /// Returns the [DataLoader] of `identity`, creating it on first use.
    pub fn data_loader<K, V>(&self, identity: LoaderIdentity<K, V>) -> Result<DataLoader<S, K, V>>
    where
        K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
        V: Send + Sync + Clone + 'static,
    {
        let unknown = || Error::UnknownLoader { id: identity.id };
        let registration = self
            .registrations
            .get(&identity.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(unknown)?
            .downcast::<Registration<S, K, V>>()
            .map_err(|_| unknown())?;

        let data_loader = registration.data_loader.get_or_init(|| {
            DataLoader::new(
                identity.id,
                self.store.clone(),
                registration.selector.clone(),
                registration.loader.clone(),
                registration.batch.clone(),
            )
        });
        Ok(data_loader.clone())
    }

    /// Submits a request and returns the future shared by every caller of the
    /// same key.
    pub fn request<K, V>(&self, request: Request<K, V>) -> Result<Pending<V>>
    where
        K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
        V: Send + Sync + Clone + 'static,
    {
        let (identity, key) = request.into_parts();
        self.data_loader(identity)?.load_one(key)
    }

    /// Requests `key` and waits for its value.
    pub async fn load<K, V>(&self, identity: LoaderIdentity<K, V>, key: K) -> Outcome<V>
    where
        K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
        V: Send + Sync + Clone + 'static,
    {
        self.request(identity.make_request().key(key)).map_err(Arc::new)?.await
    }
}
