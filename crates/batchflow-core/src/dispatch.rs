//! Worker dispatch and completion plumbing

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::{Pin, pin};
use std::task::{Context, Poll};

use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::batch::Batch;
use crate::error::BatchError;
use crate::feed::{FeedSender, Panic, Signal};
use crate::stats::BatchStats;

/// Sending half of the operator's output
pub(crate) type OutputSender<R, E> = mpsc::Sender<Result<R, BatchError<E>>>;

/// Spawned task that is aborted when its guard is dropped
#[derive(Debug)]
pub(crate) struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(task))
    }

    /// Abort the task and wait until it is gone, so it cannot emit anything afterwards
    pub(crate) async fn cancel(mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }

    /// Poll for the task's exit, surfacing a panic as `JoinError::is_panic`
    pub(crate) fn poll_join(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), JoinError>> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Invokes the worker and drives at most one of its output streams at a time.
pub(crate) struct Dispatcher<F, T, R, E> {
    worker: F,
    output: OutputSender<R, E>,
    feed: FeedSender<T, E>,
    stats: BatchStats,
    current: Option<TaskGuard>,
}

impl<F, W, T, R, E> Dispatcher<F, T, R, E>
where
    F: FnMut(Batch<T>) -> W,
    W: Stream<Item = Result<R, E>> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(
        worker: F,
        output: OutputSender<R, E>,
        feed: FeedSender<T, E>,
        stats: BatchStats,
    ) -> Self {
        Self {
            worker,
            output,
            feed,
            stats,
            current: None,
        }
    }

    /// Hand `batch` to the worker and start forwarding its output.
    ///
    /// Only called after the previous invocation reported completion, so the
    /// replaced guard (if any) belongs to a finished task.
    pub(crate) fn dispatch(&mut self, batch: Batch<T>) {
        let len = batch.len();
        self.stats.record_batch(len);
        log::debug!(
            "dispatching batch #{} ({len} items)",
            self.stats.batches()
        );

        let results = (self.worker)(batch);
        self.current = Some(TaskGuard::spawn(forward(
            results,
            self.output.clone(),
            self.feed.clone(),
            self.stats.clone(),
        )));
    }

    /// Abort the outstanding worker, if any, and wait for it to stop
    pub(crate) async fn cancel(&mut self) {
        if let Some(task) = self.current.take() {
            task.cancel().await;
        }
    }

    /// Cancel the outstanding worker, then emit `err` as the final output item
    pub(crate) async fn fail(mut self, err: BatchError<E>) {
        self.cancel().await;
        let _ = self.output.send(Err(err)).await;
    }
}

/// Forward one worker's results downstream in emission order, then report
/// its termination into the feed. A panicking worker stream is reported as
/// [`Signal::Panicked`].
async fn forward<W, T, R, E>(
    results: W,
    output: OutputSender<R, E>,
    feed: FeedSender<T, E>,
    stats: BatchStats,
) where
    W: Stream<Item = Result<R, E>>,
{
    let drained = AssertUnwindSafe(drain(results, &output, &stats))
        .catch_unwind()
        .await;
    let signal = match drained {
        Ok(Some(signal)) => signal,
        // Downstream dropped the output; the driver is being torn down.
        Ok(None) => return,
        Err(payload) => Signal::Panicked(Panic::new("worker", payload)),
    };
    let _ = feed.send(signal);
}

/// Terminal signal for the feed, or `None` if the output is gone
async fn drain<W, T, R, E>(
    results: W,
    output: &OutputSender<R, E>,
    stats: &BatchStats,
) -> Option<Signal<T, E>>
where
    W: Stream<Item = Result<R, E>>,
{
    let mut results = pin!(results);
    while let Some(next) = results.next().await {
        match next {
            Ok(result) => {
                output.send(Ok(result)).await.ok()?;
                stats.record_result();
            }
            Err(e) => return Some(Signal::WorkerFailed(e)),
        }
    }
    Some(Signal::WorkerIdle)
}
