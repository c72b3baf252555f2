use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tracing::{info_span, Instrument};

use super::apply::validate_and_apply;
use super::dedupe::{Pending, Responder};
use super::loader::BatchLoader;
use super::registry::{LoaderId, SelectFn};
use crate::core::config::Batch;
use crate::core::store::Store;
use crate::core::{Error, Result};

/// Keys collected by one window, in arrival order.
type Window<K, V> = Vec<(K, Responder<V>)>;

/// Upper bound on the extra yields a flush spends waiting for a window that is
/// still growing.
const SETTLE_ROUNDS: usize = 64;

struct Requests<K, V: Clone> {
    /// Every key that has been requested and not yet resolved, across windows.
    pending: HashMap<K, Pending<V>>,
    window: Window<K, V>,
    /// Bumped whenever a window is taken, so a stale flush cannot steal the
    /// next window.
    generation: u64,
    /// Set once a flush has been spawned for the open window.
    flushing: bool,
    /// Runtime of the request that opened the window.
    handle: Option<Handle>,
}

impl<K, V: Clone> Requests<K, V> {
    fn take(&mut self) -> Window<K, V> {
        self.generation += 1;
        self.flushing = false;
        std::mem::take(&mut self.window)
    }

    fn take_if(&mut self, generation: u64) -> Option<Window<K, V>> {
        if self.generation == generation && !self.window.is_empty() {
            Some(self.take())
        } else {
            None
        }
    }
}

struct DataLoaderInner<S: Store, K, V: Clone> {
    id: LoaderId,
    store: Arc<S>,
    selector: SelectFn<K, S::State, V>,
    loader: Arc<dyn BatchLoader<K>>,
    batch: Batch,
    requests: Mutex<Requests<K, V>>,
    batches: AtomicUsize,
}

/// Collects the keys requested for one loader within a window and resolves
/// them with at most one call to its [BatchLoader].
pub struct DataLoader<S: Store, K, V: Clone> {
    inner: Arc<DataLoaderInner<S, K, V>>,
}

impl<S: Store, K, V: Clone> Clone for DataLoader<S, K, V> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S, K, V> DataLoader<S, K, V>
where
    S: Store,
    K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
    V: Send + Sync + Clone + 'static,
{
    pub(crate) fn new(
        id: LoaderId,
        store: Arc<S>,
        selector: SelectFn<K, S::State, V>,
        loader: Arc<dyn BatchLoader<K>>,
        batch: Batch,
    ) -> Self {
        let requests = Requests {
            pending: HashMap::new(),
            window: Vec::new(),
            generation: 0,
            flushing: false,
            handle: None,
        };
        Self {
            inner: Arc::new(DataLoaderInner {
                id,
                store,
                selector,
                loader,
                batch,
                requests: Mutex::new(requests),
                batches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn id(&self) -> LoaderId {
        self.inner.id
    }

    /// Number of keys that were requested and have not resolved yet.
    pub fn in_flight(&self) -> usize {
        self.inner.requests().pending.len()
    }

    /// Number of times the batch loader has been called.
    pub fn batches(&self) -> usize {
        self.inner.batches.load(Ordering::SeqCst)
    }

    /// Adds `key` to the open window, or joins the request already in flight
    /// for it.
    ///
    /// The key is enqueued before this returns. The window starts closing once
    /// a caller awaits one of its futures, so every call made before that
    /// lands in the same batch, whichever worker thread runs the flush.
    pub fn load_one(&self, key: K) -> Result<Pending<V>> {
        enum Action<K, V> {
            ImmediateLoad(Window<K, V>),
            Delay,
        }

        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (action, pending) = {
            let mut requests = self.inner.requests();
            if let Some(pending) = requests.pending.get(&key) {
                tracing::trace!(loader = %self.inner.id, ?key, "joining in-flight request");
                return Ok(pending.clone());
            }

            let generation = requests.generation;
            let inner = Arc::downgrade(&self.inner);
            let (responder, pending) = Pending::channel(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.flush(generation);
                }
            });
            requests.pending.insert(key.clone(), pending.clone());
            requests.window.push((key, responder));

            if requests.window.len() == 1 {
                tracing::debug!(loader = %self.inner.id, generation, "window opened");
                requests.handle = Some(handle.clone());
            }

            let action = if self.inner.batch.is_full(requests.window.len()) {
                Action::ImmediateLoad(requests.take())
            } else {
                Action::Delay
            };
            (action, pending)
        };

        if let Action::ImmediateLoad(window) = action {
            let inner = self.inner.clone();
            let task = async move { inner.do_load(window).await };
            handle.spawn(task.instrument(info_span!("immediate_load", loader = %self.inner.id)));
        }

        Ok(pending)
    }
}

/// Drops the keys of a window from the pending table when it goes out of
/// scope, including on unwind or when the flush task is dropped.
struct Release<'a, S, K, V>
where
    S: Store,
    K: Hash + Eq,
    V: Clone,
{
    inner: &'a DataLoaderInner<S, K, V>,
    keys: &'a [K],
}

impl<'a, S, K, V> Drop for Release<'a, S, K, V>
where
    S: Store,
    K: Hash + Eq,
    V: Clone,
{
    fn drop(&mut self) {
        let mut requests = self.inner.requests.lock().unwrap_or_else(PoisonError::into_inner);
        for key in self.keys {
            requests.pending.remove(key);
        }
    }
}

impl<S, K, V> DataLoaderInner<S, K, V>
where
    S: Store,
    K: Send + Sync + Hash + Eq + Clone + Debug + 'static,
    V: Send + Sync + Clone + 'static,
{
    fn requests(&self) -> MutexGuard<'_, Requests<K, V>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the task that closes window `generation`, unless one is already
    /// running or the window was taken in the meantime.
    fn flush(self: Arc<Self>, generation: u64) {
        let handle = {
            let mut requests = self.requests();
            if requests.generation != generation || requests.flushing {
                return;
            }
            let Some(handle) = requests.handle.clone() else {
                return;
            };
            requests.flushing = true;
            handle
        };

        let id = self.id;
        let task = async move {
            self.batch.close_window().await;
            self.settle(generation).await;

            let window = self.requests().take_if(generation);
            if let Some(window) = window {
                self.do_load(window).await
            }
        };
        handle.spawn(task.instrument(info_span!("flush_window", loader = %id)));
    }

    /// Yields until the window stops growing, so requests chained right after
    /// the first await still join it.
    async fn settle(&self, generation: u64) {
        let mut seen = self.requests().window.len();
        for _ in 0..SETTLE_ROUNDS {
            tokio::task::yield_now().await;
            let requests = self.requests();
            if requests.generation != generation || requests.window.len() == seen {
                return;
            }
            seen = requests.window.len();
        }
    }

    async fn do_load(&self, window: Window<K, V>) {
        let keys: Vec<K> = window.iter().map(|(key, _)| key.clone()).collect();
        let release = Release { inner: self, keys: &keys };
        let outcome = self.resolve(&keys).await;
        drop(release);

        match outcome {
            Ok(values) => {
                for ((_, responder), value) in window.into_iter().zip(values) {
                    responder.send(Ok(value));
                }
            }
            Err(error) => {
                tracing::warn!(loader = %self.id, keys = keys.len(), "batch failed: {}", error);
                let error = Arc::new(error);
                for (_, responder) in window {
                    responder.send(Err(error.clone()));
                }
            }
        }
    }

    async fn resolve(&self, keys: &[K]) -> Result<Vec<V>> {
        let missing: Vec<K> = {
            let state = self.store.get_state();
            keys.iter()
                .filter(|key| (self.selector)(*key, &*state).is_none())
                .cloned()
                .collect()
        };
        tracing::debug!(collected = keys.len(), missing = missing.len(), "window closed");

        if !missing.is_empty() {
            self.batches.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(loader = %self.id, keys = missing.len(), "calling batch loader");
            let result = self.loader.load(&missing);
            validate_and_apply(self.store.as_ref(), self.selector.as_ref(), result, &missing)
                .await?;
        }

        let state = self.store.get_state();
        keys.iter()
            .map(|key| {
                (self.selector)(key, &*state)
                    .ok_or_else(|| Error::WriteFailed { key: format!("{:?}", key) })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use futures_util::future::join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::{mpsc, Notify};

    use super::*;
    use crate::core::counter::{AtomicCounter, Count};
    use crate::core::data_loader::LoaderResult;
    use crate::core::store::ReducerStore;

    type State = BTreeMap<u64, String>;

    static IDS: AtomicCounter = AtomicCounter::new(0);

    fn store(initial: &[(u64, &str)]) -> Arc<ReducerStore<State>> {
        let initial: State = initial.iter().map(|(id, name)| (*id, name.to_string())).collect();
        Arc::new(ReducerStore::new(initial, |state: &State, update| {
            let mut state = state.clone();
            if update.is("DELETE") {
                if let Ok(id) = update.payload_as::<u64>() {
                    state.remove(&id);
                }
            } else if let Ok((id, name)) = update.payload_as::<(u64, String)>() {
                state.insert(id, name);
            }
            state
        }))
    }

    fn set(id: u64) -> serde_json::Value {
        json!({"type": "SET", "payload": [id, format!("item {id}")]})
    }

    /// Records every call and answers with one update per key.
    fn recording(calls: Arc<Mutex<Vec<Vec<u64>>>>) -> Arc<dyn BatchLoader<u64>> {
        Arc::new(move |keys: &[u64]| {
            calls.lock().unwrap().push(keys.to_vec());
            LoaderResult::resolved(keys.iter().copied().map(set).collect())
        })
    }

    fn data_loader(
        store: Arc<ReducerStore<State>>,
        loader: Arc<dyn BatchLoader<u64>>,
        batch: Batch,
    ) -> DataLoader<ReducerStore<State>, u64, String> {
        let selector: SelectFn<u64, State, String> =
            Arc::new(|id: &u64, state: &State| state.get(id).cloned());
        DataLoader::new(LoaderId::from(IDS.next()), store, selector, loader, batch)
    }

    #[tokio::test]
    async fn test_batches_window() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default());

        let pending: Vec<_> = (1..=3).map(|id| dl.load_one(id).unwrap()).collect();
        let values: Vec<_> = join_all(pending).await.into_iter().map(|outcome| outcome.unwrap()).collect();

        assert_eq!(values, vec!["item 1", "item 2", "item 3"]);
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(dl.batches(), 1);
        assert_eq!(dl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_same_key_shares_future() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default());

        let a = dl.load_one(7).unwrap();
        let b = dl.load_one(7).unwrap();
        assert!(a.ptr_eq(&b));
        assert_eq!(dl.in_flight(), 1);

        assert_eq!(a.await.unwrap(), b.await.unwrap());
        assert_eq!(*calls.lock().unwrap(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn test_present_keys_skip_loader() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[(1, "cached")]), recording(calls.clone()), Batch::default());

        assert_eq!(dl.load_one(1).unwrap().await.unwrap(), "cached");
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(dl.batches(), 0);
    }

    #[tokio::test]
    async fn test_resolved_key_is_fetched_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default());

        dl.load_one(1).unwrap().await.unwrap();
        // The next window finds the key in the store.
        dl.load_one(1).unwrap().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_in_flight_key_spans_windows() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let loader: Arc<dyn BatchLoader<u64>> = {
            let gate = gate.clone();
            Arc::new(move |keys: &[u64]| {
                let _ = started_tx.send(keys.to_vec());
                let gate = gate.clone();
                let updates: Vec<_> = keys.iter().copied().map(set).collect();
                LoaderResult::deferred(async move {
                    gate.notified().await;
                    Ok(updates.into())
                })
            })
        };
        let dl = data_loader(store(&[]), loader, Batch::default());

        let first = dl.load_one(1).unwrap();
        let waiting = tokio::spawn(first.clone());
        assert_eq!(started_rx.recv().await.unwrap(), vec![1]);

        // The first window is fetching; a new request for the same key joins it.
        let second = dl.load_one(1).unwrap();
        assert!(first.ptr_eq(&second));

        gate.notify_one();
        assert_eq!(second.await.unwrap(), "item 1");
        assert_eq!(waiting.await.unwrap().unwrap(), "item 1");
        assert_eq!(dl.batches(), 1);
    }

    #[tokio::test]
    async fn test_max_size_closes_window_early() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default().max_size(2));

        let pending: Vec<_> = (1..=3).map(|id| dl.load_one(id).unwrap()).collect();
        for outcome in join_all(pending).await {
            outcome.unwrap();
        }

        let mut calls = calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls, vec![vec![1, 2], vec![3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_keeps_window_open() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default().delay(20));

        let a = dl.load_one(1).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let b = dl.load_one(2).unwrap();

        assert_eq!(a.await.unwrap(), "item 1");
        assert_eq!(b.await.unwrap(), "item 2");
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_failure_rejects_whole_window() {
        let loader: Arc<dyn BatchLoader<u64>> =
            Arc::new(|_: &[u64]| LoaderResult::resolved(json!({"type": "UNRELATED"})));
        let dl = data_loader(store(&[(1, "cached")]), loader, Batch::default());

        let present = dl.load_one(1).unwrap();
        let missing = dl.load_one(2).unwrap();

        let a = present.await.unwrap_err();
        let b = missing.await.unwrap_err();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(a.as_ref(), Error::WriteFailed { key } if key == "2"));
        assert_eq!(dl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_later_windows() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader: Arc<dyn BatchLoader<u64>> = {
            let attempts = attempts.clone();
            Arc::new(move |keys: &[u64]| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    LoaderResult::deferred(async { Err(anyhow::anyhow!("unavailable")) })
                } else {
                    LoaderResult::resolved(keys.iter().copied().map(set).collect())
                }
            })
        };
        let dl = data_loader(store(&[]), loader, Batch::default());

        let error = dl.load_one(1).unwrap().await.unwrap_err();
        assert_eq!(error.to_string(), "unavailable");

        assert_eq!(dl.load_one(1).unwrap().await.unwrap(), "item 1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unpolled_window_stays_open() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default());

        let a = dl.load_one(1).unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let b = dl.load_one(2).unwrap();
        assert!(calls.lock().unwrap().is_empty());

        assert_eq!(a.await.unwrap(), "item 1");
        assert_eq!(b.await.unwrap(), "item 2");
        assert_eq!(*calls.lock().unwrap(), vec![vec![1, 2]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_burst_is_one_window_on_many_workers() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls.clone()), Batch::default());

        let pending: Vec<_> = (0..2000).map(|id| dl.load_one(id).unwrap()).collect();
        for outcome in join_all(pending).await {
            outcome.unwrap();
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2000);
        assert_eq!(dl.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panicking_loader_releases_keys() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let loader: Arc<dyn BatchLoader<u64>> = {
            let attempts = attempts.clone();
            Arc::new(move |keys: &[u64]| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("loader blew up");
                }
                LoaderResult::resolved(keys.iter().copied().map(set).collect())
            })
        };
        let dl = data_loader(store(&[]), loader, Batch::default());

        let error = dl.load_one(1).unwrap().await.unwrap_err();
        assert!(matches!(error.as_ref(), Error::Canceled));
        assert_eq!(dl.in_flight(), 0);

        assert_eq!(dl.load_one(1).unwrap().await.unwrap(), "item 1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_present_key_removed_during_fetch() {
        let loader: Arc<dyn BatchLoader<u64>> = Arc::new(|keys: &[u64]| {
            let mut updates: Vec<_> = keys.iter().copied().map(set).collect();
            updates.push(json!({"type": "DELETE", "payload": 1}));
            LoaderResult::resolved(updates.into())
        });
        let dl = data_loader(store(&[(1, "cached")]), loader, Batch::default());

        let present = dl.load_one(1).unwrap();
        let missing = dl.load_one(2).unwrap();

        let a = present.await.unwrap_err();
        let b = missing.await.unwrap_err();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(a.as_ref(), Error::WriteFailed { key } if key == "1"));
        assert_eq!(dl.batches(), 1);
        assert_eq!(dl.in_flight(), 0);
    }

    #[test]
    fn test_requires_runtime() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dl = data_loader(store(&[]), recording(calls), Batch::default());

        assert!(matches!(dl.load_one(1), Err(Error::NoRuntime)));
        assert_eq!(dl.in_flight(), 0);
    }
}
