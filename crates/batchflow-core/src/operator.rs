//! The batching operator: driver task and output stream
//!
//! ```text
//!  source ──pump──┐
//!                 ├──> feed ──> driver (BatchMachine) ──Dispatch──> worker ──results──> output
//!  worker done ───┘                                                   │
//!        ^────────────────────────────────────────────────────────────┘
//! ```

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::future::BoxFuture;
use futures_util::stream::FusedStream;
use futures_util::{FutureExt, Stream};
use tokio::sync::mpsc;

use crate::batch::Batch;
use crate::dispatch::{Dispatcher, OutputSender, TaskGuard};
use crate::error::BatchError;
use crate::feed::{self, Failure};
use crate::state::{Action, BatchMachine};
use crate::stats::BatchStats;

/// Results waiting for the consumer. Kept at one so a slow consumer stalls
/// the worker rather than piling up results.
const OUTPUT_CAPACITY: usize = 1;

/// Batch `source` through `worker` with at most one worker invocation in flight.
///
/// Items arriving while a worker runs are buffered and handed to the next
/// invocation as one [`Batch`]; an item arriving while nothing runs is
/// dispatched on its own. Batch size therefore follows worker latency.
///
/// The returned stream is lazy: nothing is spawned until it is first polled,
/// and it must be polled inside a tokio runtime. Dropping it cancels the run:
/// the source is no longer consumed, the running worker is aborted and
/// buffered items are discarded.
///
/// # Failures
///
/// When the source fails, the running worker is cancelled before its
/// remaining results are forwarded, and [`BatchError::Source`] is the last
/// item. When a worker stream fails, the items buffered behind it are
/// discarded and [`BatchError::Worker`] is the last item. A panic in the
/// source, the worker function or a worker stream is resumed on the task
/// polling the output.
pub fn batch<S, F, W, T, R, E>(source: S, worker: F) -> Batched<R, E>
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    F: FnMut(Batch<T>) -> W + Send + 'static,
    W: Stream<Item = Result<R, E>> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let (output, rx) = mpsc::channel(OUTPUT_CAPACITY);
    let stats = BatchStats::new();
    let driver = drive(source, worker, output, stats.clone()).boxed();
    Batched {
        pending: Some(driver),
        driver: None,
        rx,
        stats,
        terminated: false,
    }
}

/// Single task that owns the state machine and applies every feed event
async fn drive<S, F, W, T, R, E>(source: S, worker: F, output: OutputSender<R, E>, stats: BatchStats)
where
    S: Stream<Item = Result<T, E>> + Send + 'static,
    F: FnMut(Batch<T>) -> W,
    W: Stream<Item = Result<R, E>> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let (feed_tx, mut feed_rx) = feed::channel();
    let pump = TaskGuard::spawn(feed::pump_source(source, feed_tx.clone()));
    let mut dispatcher = Dispatcher::new(worker, output, feed_tx, stats);
    let mut machine = BatchMachine::new();

    // The dispatcher keeps a feed sender alive, so this only ends by returning.
    while let Some(signal) = feed_rx.recv().await {
        log::trace!("feed: {}", signal.kind());
        let event = match signal.into_event() {
            Ok(event) => event,
            Err(Failure::Source(e)) => {
                log::debug!("source failed, tearing down");
                drop(pump);
                return dispatcher.fail(BatchError::Source(e)).await;
            }
            Err(Failure::Worker(e)) => {
                log::debug!(
                    "worker failed, discarding {} buffered items",
                    machine.state().pending()
                );
                pump.cancel().await;
                return dispatcher.fail(BatchError::Worker(e)).await;
            }
            Err(Failure::Panic(p)) => {
                log::debug!("{} panicked, tearing down", p.origin());
                pump.cancel().await;
                dispatcher.cancel().await;
                p.resume();
            }
        };

        match machine.step(event) {
            Action::None => {}
            Action::Dispatch(batch) => dispatcher.dispatch(batch),
            Action::Complete => {
                log::debug!("source drained, completing");
                return;
            }
        }
    }
}

/// Output of [`batch`]: worker results in order, ending after the final batch
/// or with a single [`BatchError`].
#[must_use = "streams do nothing unless polled"]
pub struct Batched<R, E> {
    pending: Option<BoxFuture<'static, ()>>,
    driver: Option<TaskGuard>,
    rx: mpsc::Receiver<Result<R, BatchError<E>>>,
    stats: BatchStats,
    terminated: bool,
}

impl<R, E> std::fmt::Debug for Batched<R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batched")
            .field("started", &self.pending.is_none())
            .field("terminated", &self.terminated)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<R, E> Batched<R, E> {
    /// Live counters for this run
    pub fn stats(&self) -> BatchStats {
        self.stats.clone()
    }
}

impl<R, E> Stream for Batched<R, E> {
    type Item = Result<R, BatchError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        if let Some(driver) = this.pending.take() {
            this.driver = Some(TaskGuard::spawn(driver));
        }

        match ready!(this.rx.poll_recv(cx)) {
            Some(Ok(result)) => Poll::Ready(Some(Ok(result))),
            Some(Err(e)) => {
                this.terminated = true;
                this.driver = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                // The driver dropped its sender; a panic unwinding it looks the same.
                if let Some(driver) = this.driver.as_mut() {
                    let exit = ready!(driver.poll_join(cx));
                    this.driver = None;
                    if let Err(e) = exit {
                        if e.is_panic() {
                            this.terminated = true;
                            std::panic::resume_unwind(e.into_panic());
                        }
                    }
                }
                this.terminated = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<R, E> FusedStream for Batched<R, E> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Extension trait adding [`batch`] as a method on fallible streams
pub trait BatchExt<T, E>: Stream<Item = Result<T, E>> + Sized {
    fn batch<F, W, R>(self, worker: F) -> Batched<R, E>
    where
        Self: Send + 'static,
        F: FnMut(Batch<T>) -> W + Send + 'static,
        W: Stream<Item = Result<R, E>> + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        batch(self, worker)
    }
}

impl<S, T, E> BatchExt<T, E> for S where S: Stream<Item = Result<T, E>> {}
