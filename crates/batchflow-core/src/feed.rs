//! Event merger: one ordered feed for upstream items and worker completions
//!
//! The upstream pump and every worker invocation write into the same
//! channel, and the driver task is its only reader. Item arrival and
//! "worker finished" are therefore totally ordered by delivery, and the state
//! machine never sees them race.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::pin::pin;

use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::state::Event;

/// Everything the driver can receive, including the failures the state
/// machine does not model
#[derive(Debug)]
pub(crate) enum Signal<T, E> {
    Item(T),
    SourceDone,
    SourceFailed(E),
    WorkerIdle,
    WorkerFailed(E),
    Panicked(Panic),
}

/// Terminal failure pulled out of the feed
#[derive(Debug)]
pub(crate) enum Failure<E> {
    Source(E),
    Worker(E),
    Panic(Panic),
}

/// Panic caught in the pump or a forwarding task, carried to the driver
pub(crate) struct Panic {
    origin: &'static str,
    payload: Box<dyn Any + Send>,
}

impl Panic {
    pub(crate) fn new(origin: &'static str, payload: Box<dyn Any + Send>) -> Self {
        Self { origin, payload }
    }

    pub(crate) fn origin(&self) -> &'static str {
        self.origin
    }

    /// Re-raise on the current thread with the original payload
    pub(crate) fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Panic")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl<T, E> Signal<T, E> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Item(_) => "item",
            Self::SourceDone => "source done",
            Self::SourceFailed(_) => "source failed",
            Self::WorkerIdle => "worker idle",
            Self::WorkerFailed(_) => "worker failed",
            Self::Panicked(_) => "panicked",
        }
    }

    /// Split into a state machine event or a failure that ends the run
    pub(crate) fn into_event(self) -> Result<Event<T>, Failure<E>> {
        match self {
            Self::Item(item) => Ok(Event::Item(item)),
            Self::SourceDone => Ok(Event::SourceDone),
            Self::WorkerIdle => Ok(Event::WorkerIdle),
            Self::SourceFailed(e) => Err(Failure::Source(e)),
            Self::WorkerFailed(e) => Err(Failure::Worker(e)),
            Self::Panicked(p) => Err(Failure::Panic(p)),
        }
    }
}

/// Writing half, cloned into the pump and into each worker invocation
pub(crate) type FeedSender<T, E> = mpsc::UnboundedSender<Signal<T, E>>;

/// Reading half, owned by the driver
pub(crate) type FeedReceiver<T, E> = mpsc::UnboundedReceiver<Signal<T, E>>;

pub(crate) fn channel<T, E>() -> (FeedSender<T, E>, FeedReceiver<T, E>) {
    mpsc::unbounded_channel()
}

/// Forward every upstream item into the feed, followed by exactly one
/// termination signal.
///
/// Stops early if the driver is gone. A panicking source is reported as
/// [`Signal::Panicked`].
pub(crate) async fn pump_source<S, T, E>(source: S, feed: FeedSender<T, E>)
where
    S: Stream<Item = Result<T, E>>,
{
    let pumped = AssertUnwindSafe(pump_items(source, &feed)).catch_unwind().await;
    if let Err(payload) = pumped {
        let _ = feed.send(Signal::Panicked(Panic::new("source", payload)));
    }
}

async fn pump_items<S, T, E>(source: S, feed: &FeedSender<T, E>)
where
    S: Stream<Item = Result<T, E>>,
{
    let mut source = pin!(source);
    while let Some(next) = source.next().await {
        match next {
            Ok(item) => {
                if feed.send(Signal::Item(item)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = feed.send(Signal::SourceFailed(e));
                return;
            }
        }
    }
    let _ = feed.send(Signal::SourceDone);
}
