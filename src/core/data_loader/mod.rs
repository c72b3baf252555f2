mod apply;
mod data_loader;
mod dedupe;
mod loader;
mod registry;
mod request;

pub use data_loader::DataLoader;
pub use dedupe::{Outcome, Pending};
pub use loader::{BatchLoader, LoaderResult};
pub use registry::{LoaderId, LoaderIdentity, Loaders, SelectFn};
pub use request::{Request, RequestFactory};
