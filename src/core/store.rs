use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Field that discriminates one kind of update from another.
pub const KIND: &str = "type";

const PAYLOAD: &str = "payload";

#[derive(thiserror::Error, Debug)]
#[error("update record has no \"{}\" field", KIND)]
pub struct MissingKind;

/// A structured record describing one change to a [Store]'s state.
///
/// Any JSON object carrying a [KIND] field is an update. By convention the
/// data travels under `payload`, which is the shape [Update::new] builds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Update(Map<String, Value>);

impl Update {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        let mut record = Map::new();
        record.insert(KIND.to_string(), Value::String(kind.into()));
        record.insert(PAYLOAD.to_string(), payload);
        Self(record)
    }

    pub fn kind(&self) -> &Value {
        // Presence is checked on construction.
        self.0.get(KIND).unwrap_or(&Value::Null)
    }

    pub fn kind_str(&self) -> Option<&str> {
        self.kind().as_str()
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind_str() == Some(kind)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get(PAYLOAD)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(self.payload().unwrap_or(&Value::Null))
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }
}

impl TryFrom<Map<String, Value>> for Update {
    type Error = MissingKind;

    fn try_from(record: Map<String, Value>) -> Result<Self, Self::Error> {
        if record.contains_key(KIND) {
            Ok(Self(record))
        } else {
            Err(MissingKind)
        }
    }
}

impl TryFrom<Value> for Update {
    /// Hands the value back when it is not an update.
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(record) if record.contains_key(KIND) => Ok(Self(record)),
            value => Err(value),
        }
    }
}

impl From<Update> for Map<String, Value> {
    fn from(update: Update) -> Self {
        update.0
    }
}

impl From<Update> for Value {
    fn from(update: Update) -> Self {
        Value::Object(update.0)
    }
}

/// The container holding authoritative data that loaders fill in.
#[async_trait::async_trait]
pub trait Store: Send + Sync + 'static {
    type State: Send + Sync + 'static;

    /// Returns a snapshot of the current state.
    fn get_state(&self) -> Arc<Self::State>;

    /// Applies a single update.
    async fn dispatch(&self, update: Update) -> anyhow::Result<()>;
}

type Reducer<S> = Box<dyn Fn(&S, &Update) -> S + Send + Sync>;

/// In-process [Store] that folds each update into its state through a
/// reducer and notifies subscribers after every applied update.
pub struct ReducerStore<S> {
    state: RwLock<Arc<S>>,
    reducer: Reducer<S>,
    notify: broadcast::Sender<Update>,
}

impl<S: Send + Sync + 'static> ReducerStore<S> {
    pub fn new(initial: S, reducer: impl Fn(&S, &Update) -> S + Send + Sync + 'static) -> Self {
        let (notify, _) = broadcast::channel(64);
        Self { state: RwLock::new(Arc::new(initial)), reducer: Box::new(reducer), notify }
    }

    /// Receives every update after it has been applied.
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.notify.subscribe()
    }

    /// Applies an update without going through the async interface.
    pub fn apply(&self, update: Update) {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let next = (self.reducer)(&state, &update);
            *state = Arc::new(next);
        }
        tracing::trace!(kind = %update.kind(), "applied update");
        // No subscribers is fine.
        let _ = self.notify.send(update);
    }
}

#[async_trait::async_trait]
impl<S: Send + Sync + 'static> Store for ReducerStore<S> {
    type State = S;

    fn get_state(&self) -> Arc<S> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn dispatch(&self, update: Update) -> anyhow::Result<()> {
        self.apply(update);
        Ok(())
    }
}
