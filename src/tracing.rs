use std::env;
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

const LONG_ENV_FILTER_VAR_NAME: &str = "KEYLOADER_LOG_LEVEL";
const SHORT_ENV_FILTER_VAR_NAME: &str = "KL_LOG_LEVEL";

/// A compact `fmt` subscriber showing only this crate's events, at the level
/// named by `KEYLOADER_LOG_LEVEL` (or `KL_LOG_LEVEL`), INFO otherwise.
pub fn default_tracing() -> impl Subscriber {
    let level = level_from(|name| env::var(name).ok());

    tracing_subscriber::fmt()
        .with_max_level(level)
        .compact()
        .finish()
        .with(default_filter_target())
}

pub fn default_filter_target<S: Subscriber>() -> impl Layer<S> {
    filter_fn(|metadata| metadata.target().starts_with("keyloader"))
}

fn level_from(lookup: impl Fn(&str) -> Option<String>) -> Level {
    lookup(LONG_ENV_FILTER_VAR_NAME)
        .or_else(|| lookup(SHORT_ENV_FILTER_VAR_NAME))
        .and_then(|v| Level::from_str(&v).ok())
        .unwrap_or(Level::INFO)
}
