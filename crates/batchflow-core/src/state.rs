//! Batching state machine
//!
//! Every decision the operator makes goes through [`step`]: one feed event
//! in, the next state and one [`Action`] out. Nothing here touches channels,
//! tasks or clocks, so the whole transition table is testable as plain data.
//!
//! | State          | Event        | Next           | Action                          |
//! |----------------|--------------|----------------|---------------------------------|
//! | `Idle`         | `Item(x)`    | `Running`      | `Dispatch([x])`                 |
//! | `Idle`         | `WorkerIdle` | `Idle`         | `None`                          |
//! | `Idle`         | `SourceDone` | `Idle`         | `Complete`                      |
//! | `Running`      | `Item(x)`    | `Buffering([x])` | `None`                        |
//! | `Running`      | `WorkerIdle` | `Idle`         | `Complete` if source done, else `None` |
//! | `Buffering(b)` | `Item(x)`    | `Buffering(b+x)` | `None`                        |
//! | `Buffering(b)` | `WorkerIdle` | `Running`      | `Dispatch(b)`                   |
//! | busy           | `SourceDone` | unchanged      | `None`                          |

use crate::batch::Batch;

/// Accumulator state between feed events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State<T> {
    /// No pending batch, no worker running
    Idle,
    /// Worker running, nothing arrived since it was dispatched
    Running,
    /// Worker running, holding the items that arrived since dispatch
    Buffering(Batch<T>),
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self::Idle
    }
}

impl<T> State<T> {
    /// Number of worker invocations outstanding in this state (0 or 1)
    pub fn in_flight(&self) -> usize {
        match self {
            Self::Idle => 0,
            Self::Running | Self::Buffering(_) => 1,
        }
    }

    /// Items waiting for the next dispatch
    pub fn pending(&self) -> usize {
        match self {
            Self::Buffering(batch) => batch.len(),
            Self::Idle | Self::Running => 0,
        }
    }
}

/// One entry of the merged feed, as seen by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    /// Upstream produced an item
    Item(T),
    /// The outstanding worker's output stream terminated
    WorkerIdle,
    /// Upstream terminated normally
    SourceDone,
}

/// What the operator has to do after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action<T> {
    None,
    /// Invoke the worker with this batch
    Dispatch(Batch<T>),
    /// Terminate the output normally
    Complete,
}

/// Pure transition function.
///
/// `source_done` is the source-completion flag as it stands when `event` is
/// applied; a `SourceDone` event is expected to have set it already.
pub fn step<T>(state: State<T>, event: Event<T>, source_done: bool) -> (State<T>, Action<T>) {
    match (state, event) {
        (State::Idle, Event::Item(item)) => (State::Running, Action::Dispatch(Batch::single(item))),
        (State::Idle, Event::WorkerIdle) => (State::Idle, Action::None),
        (State::Idle, Event::SourceDone) => (State::Idle, Action::Complete),
        (State::Running, Event::Item(item)) => (State::Buffering(Batch::single(item)), Action::None),
        (State::Running, Event::WorkerIdle) if source_done => (State::Idle, Action::Complete),
        (State::Running, Event::WorkerIdle) => (State::Idle, Action::None),
        (State::Buffering(mut batch), Event::Item(item)) => {
            batch.push(item);
            (State::Buffering(batch), Action::None)
        }
        (State::Buffering(batch), Event::WorkerIdle) => (State::Running, Action::Dispatch(batch)),
        (state, Event::SourceDone) => (state, Action::None),
    }
}

/// State plus source-completion flag for one operator activation.
///
/// Owned by the single driver task; [`BatchMachine::step`] is the only way
/// the state changes.
#[derive(Debug)]
pub struct BatchMachine<T> {
    state: State<T>,
    source_done: bool,
}

impl<T> Default for BatchMachine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BatchMachine<T> {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            source_done: false,
        }
    }

    pub fn state(&self) -> &State<T> {
        &self.state
    }

    pub fn is_source_done(&self) -> bool {
        self.source_done
    }

    /// Apply one feed event and return the resulting action
    pub fn step(&mut self, event: Event<T>) -> Action<T> {
        match (&self.state, &event) {
            (_, Event::SourceDone) => self.source_done = true,
            (State::Idle, Event::WorkerIdle) => {
                log::warn!("ignoring worker completion while idle");
            }
            _ => {}
        }
        let (next, action) = step(std::mem::take(&mut self.state), event, self.source_done);
        self.state = next;
        action
    }
}
