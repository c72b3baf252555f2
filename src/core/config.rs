use std::time::Duration;

use derive_setters::Setters;
use serde::{Deserialize, Serialize};

/// Controls how long a loader collects keys before it fetches them.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default, Setters)]
#[serde(rename_all = "camelCase", default)]
pub struct Batch {
    /// Milliseconds a window stays open once a caller awaits one of its
    /// requests. `0` closes the window on the next scheduler tick.
    pub delay: u64,

    /// Closes the window early once it has collected this many keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[setters(strip_option)]
    pub max_size: Option<usize>,
}

impl Batch {
    pub(crate) fn is_full(&self, collected: usize) -> bool {
        self.max_size.is_some_and(|max| collected >= max)
    }

    /// Waits until the current window should close.
    pub(crate) async fn close_window(&self) {
        if self.delay == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(self.delay)).await;
        }
    }
}
