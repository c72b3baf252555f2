#![allow(clippy::module_inception)]

pub mod config;
mod counter;
pub mod data_loader;
pub mod error;
pub mod store;

pub use error::{Error, Result};
