use std::sync::atomic::{AtomicU64, Ordering};

pub trait Count {
    type Item;
    fn next(&self) -> Self::Item;
}

/// Hands out increasing values and is safe to share between threads.
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub const fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }
}

impl Count for AtomicCounter {
    type Item = u64;

    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}
