//! Batchflow Core - adaptive batching with backpressure
//!
//! Feeds a fast stream of items to a slow asynchronous worker, one batch at
//! a time. While a worker invocation runs, arriving items are buffered; when
//! it finishes, everything buffered goes out as the next batch. The operator
//! is self-clocking: a fast worker sees small batches, a slow one large
//! batches, and no item is ever dropped.
//!
//! # Example
//!
//! ```ignore
//! use batchflow_core::{Batch, BatchExt};
//! use futures_util::{StreamExt, stream};
//!
//! let writes = events
//!     .batch(|batch: Batch<Event>| stream::once(store.write_all(batch.into_vec())))
//!     .collect::<Vec<_>>()
//!     .await;
//! ```

pub mod batch;
mod dispatch;
pub mod error;
mod feed;
pub mod operator;
pub mod retry;
pub mod state;
pub mod stats;

// Re-exports for convenience
pub use batch::Batch;
pub use error::BatchError;
pub use operator::{BatchExt, Batched, batch};
pub use retry::{RetryPolicy, retry_with_backoff};
pub use state::{Action, BatchMachine, Event, State, step};
pub use stats::BatchStats;
