//! Run statistics shared between the operator and its caller

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
struct Counters {
    batches: AtomicUsize,
    items: AtomicUsize,
    largest_batch: AtomicUsize,
    results: AtomicUsize,
}

/// Counters for one batching run.
///
/// Cheap to clone; all clones observe the same counters. The operator only
/// increments them, so readers see monotonically growing values.
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    inner: Arc<Counters>,
}

impl BatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self, len: usize) {
        self.inner.batches.fetch_add(1, Ordering::Relaxed);
        self.inner.items.fetch_add(len, Ordering::Relaxed);
        self.inner.largest_batch.fetch_max(len, Ordering::Relaxed);
    }

    pub(crate) fn record_result(&self) {
        self.inner.results.fetch_add(1, Ordering::Relaxed);
    }

    /// Worker invocations so far
    pub fn batches(&self) -> usize {
        self.inner.batches.load(Ordering::Relaxed)
    }

    /// Upstream items handed to workers so far
    pub fn items(&self) -> usize {
        self.inner.items.load(Ordering::Relaxed)
    }

    pub fn largest_batch(&self) -> usize {
        self.inner.largest_batch.load(Ordering::Relaxed)
    }

    /// Worker results forwarded downstream so far
    pub fn results(&self) -> usize {
        self.inner.results.load(Ordering::Relaxed)
    }

    pub fn mean_batch_size(&self) -> f64 {
        let batches = self.batches();
        if batches == 0 {
            0.0
        } else {
            self.items() as f64 / batches as f64
        }
    }
}
