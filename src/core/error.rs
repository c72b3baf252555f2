use super::data_loader::LoaderId;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Expected exactly one key argument but got {}", given)]
    SingleArgumentOnly { given: usize },

    #[error("Batch loader did not return a future")]
    NotAwaitable,

    #[error("Batch loader resolved to neither an update nor a list of updates")]
    MalformedLoaderResult,

    #[error("Loader result at position {} is not an update", index)]
    NotAnUpdate { index: usize },

    #[error("Updates were applied but the selector still cannot resolve key {}", key)]
    WriteFailed { key: String },

    /// Whatever the batch loader's future failed with, unchanged.
    #[error(transparent)]
    Loader(anyhow::Error),

    #[error("Store rejected update: {}", _0)]
    Dispatch(anyhow::Error),

    #[error("{} is not registered with this registry", id)]
    UnknownLoader { id: LoaderId },

    #[error("Requests can only be made from within a tokio runtime")]
    NoRuntime,

    #[error("Window was dropped before it completed")]
    Canceled,
}

pub type Result<A, E = Error> = std::result::Result<A, E>;
