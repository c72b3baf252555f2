pub mod core;
pub mod tracing;

pub use crate::core::config::Batch;
pub use crate::core::data_loader::{
    BatchLoader, DataLoader, LoaderId, LoaderIdentity, LoaderResult, Loaders, Outcome, Pending,
    Request, RequestFactory,
};
pub use crate::core::store::{ReducerStore, Store, Update};
pub use crate::core::{Error, Result};
