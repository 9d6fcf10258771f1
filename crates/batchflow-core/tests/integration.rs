//! End-to-end behavior of the batching operator
//!
//! All tests run on tokio's paused clock, so sleeps complete instantly but
//! in deterministic virtual-time order. One tick is 10ms.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use batchflow_core::{Batch, BatchError, BatchExt, batch};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use tokio::time::{Instant, sleep, sleep_until, timeout};

const TICK_MS: u64 = 10;

/// Route operator logs through the test harness; `RUST_LOG` narrows them
fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .parse_default_env()
        .try_init();
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Whole ticks elapsed since `start`, rounded to the nearest tick
fn tick(start: Instant, at: Instant) -> u64 {
    ((at - start).as_millis() as u64 + TICK_MS / 2) / TICK_MS
}

/// Emit each item at its offset (ms from `start`), then complete at `done_at`.
fn timed_source(
    start: Instant,
    items: Vec<(u64, u32)>,
    done_at: u64,
) -> BoxStream<'static, Result<u32, String>> {
    stream::unfold(items.into_iter(), move |mut rest| async move {
        match rest.next() {
            Some((at, item)) => {
                sleep_until(start + ms(at)).await;
                Some((Ok(item), rest))
            }
            None => {
                sleep_until(start + ms(done_at)).await;
                None
            }
        }
    })
    .boxed()
}

/// One item every `every` ms starting at 0, completing right after the last
fn steady_source(start: Instant, count: u32, every: u64) -> BoxStream<'static, Result<u32, String>> {
    let items = (0..count).map(|i| (i as u64 * every, i)).collect::<Vec<_>>();
    let done_at = count.saturating_sub(1) as u64 * every;
    timed_source(start, items, done_at)
}

/// What the worker saw: dispatch time and batch contents, plus in-flight tracking
#[derive(Clone)]
struct Recorder {
    start: Instant,
    dispatches: Arc<Mutex<Vec<(Instant, Vec<u32>)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Recorder {
    fn new(start: Instant) -> Self {
        Self {
            start,
            dispatches: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    fn record(&self, items: &[u32]) {
        self.dispatches
            .lock()
            .unwrap()
            .push((Instant::now(), items.to_vec()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn batches(&self) -> Vec<Vec<u32>> {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, items)| items.clone())
            .collect()
    }

    /// (tick, batch) pairs
    fn timeline(&self) -> Vec<(u64, Vec<u32>)> {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .map(|(at, items)| (tick(self.start, *at), items.clone()))
            .collect()
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Worker that sleeps `busy` and then yields its batch back as one result
    fn sleeping_worker(
        &self,
        busy: Duration,
    ) -> impl FnMut(Batch<u32>) -> BoxStream<'static, Result<Vec<u32>, String>> + Send + 'static
    {
        let rec = self.clone();
        move |batch| {
            rec.record(&batch);
            let in_flight = rec.in_flight.clone();
            let items = batch.into_vec();
            stream::once(async move {
                sleep(busy).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(items)
            })
            .boxed()
        }
    }
}

/// Sets its flag when dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn no_loss_when_source_outruns_worker() {
    init_logging();
    let start = Instant::now();
    let rec = Recorder::new(start);

    let out = batch(steady_source(start, 200, 1), rec.sleeping_worker(ms(7)));
    let results: Vec<Vec<u32>> = out.map(|r| r.unwrap()).collect().await;

    let dispatched: Vec<u32> = rec.batches().into_iter().flatten().collect();
    assert_eq!(dispatched, (0..200).collect::<Vec<_>>());
    // Results come back batch by batch in dispatch order.
    assert_eq!(results, rec.batches());
    assert_eq!(rec.max_in_flight(), 1);
    assert!(
        rec.batches().iter().any(|b| b.len() > 1),
        "a slow worker should see batched items"
    );
}

#[tokio::test(start_paused = true)]
async fn single_flight_with_bursty_source() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    // Bursts of 10 items at the same instant, every 25ms.
    let items = (0..100u32).map(|i| ((i / 10) as u64 * 25, i)).collect();
    let out = batch(timed_source(start, items, 300), rec.sleeping_worker(ms(13)));
    let results: Vec<_> = out.collect().await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(rec.max_in_flight(), 1);
    let dispatched: Vec<u32> = rec.batches().into_iter().flatten().collect();
    assert_eq!(dispatched, (0..100).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn slow_source_gives_singleton_batches() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    let out = batch(steady_source(start, 20, 50), rec.sleeping_worker(ms(10)));
    let results: Vec<_> = out.collect().await;

    assert_eq!(results.len(), 20);
    assert!(rec.batches().iter().all(|b| b.len() == 1));
}

#[tokio::test(start_paused = true)]
async fn idle_gap_dispatches_next_item_immediately() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    // Items at ticks 0, 1 and 11; worker busy for 3 ticks.
    let source = timed_source(start, vec![(0, 0), (10, 1), (110, 2)], 120);
    let out = batch(source, rec.sleeping_worker(ms(30)));
    let _: Vec<_> = out.collect().await;
    let finished = tick(start, Instant::now());

    assert_eq!(
        rec.timeline(),
        vec![(0, vec![0]), (3, vec![1]), (11, vec![2])]
    );
    // Last worker started at tick 11 and ran 3 ticks.
    assert_eq!(finished, 14);
}

#[tokio::test(start_paused = true)]
async fn buffered_tail_flushed_before_completion() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    // Worker dispatched at tick 4, one item buffered at 4.5, source done at 5.
    let source = timed_source(start, vec![(40, 1), (45, 2)], 50);
    let out = batch(source, rec.sleeping_worker(ms(30)));
    let results: Vec<Vec<u32>> = out.map(|r| r.unwrap()).collect().await;
    let finished = tick(start, Instant::now());

    assert_eq!(rec.timeline(), vec![(4, vec![1]), (7, vec![2])]);
    assert_eq!(results, vec![vec![1], vec![2]]);
    assert_eq!(finished, 10);
}

#[tokio::test(start_paused = true)]
async fn completes_only_after_last_worker() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    // Source finishes at tick 1 while the first worker runs until tick 20.
    let source = timed_source(start, vec![(0, 1), (5, 2)], 10);
    let mut out = batch(source, rec.sleeping_worker(ms(200)));

    assert_eq!(out.next().await, Some(Ok(vec![1])));
    assert_eq!(tick(start, Instant::now()), 20);
    assert_eq!(out.next().await, Some(Ok(vec![2])));
    assert_eq!(out.next().await, None);
    assert_eq!(tick(start, Instant::now()), 40);
}

#[tokio::test(start_paused = true)]
async fn multiple_results_per_batch_keep_order() {
    let start = Instant::now();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let seen = batches.clone();

    let out = steady_source(start, 50, 2).batch(move |batch: Batch<u32>| {
        seen.lock().unwrap().push(batch.to_vec());
        stream::iter(batch.into_vec())
            .then(|item| async move {
                sleep(ms(3)).await;
                Ok::<_, String>(item * 10)
            })
            .boxed()
    });
    let results: Vec<u32> = out.map(|r| r.unwrap()).collect().await;

    let expected: Vec<u32> = (0..50).map(|i| i * 10).collect();
    assert_eq!(results, expected);
    assert!(batches.lock().unwrap().len() < 50);
}

#[tokio::test(start_paused = true)]
async fn worker_failure_propagates_once() {
    init_logging();
    let start = Instant::now();
    let calls = Arc::new(AtomicUsize::new(0));
    let dispatched = Arc::new(Mutex::new(Vec::new()));
    let (counter, seen) = (calls.clone(), dispatched.clone());

    let worker = move |batch: Batch<u32>| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        seen.lock().unwrap().extend(batch.iter().copied());
        stream::once(async move {
            sleep(ms(20)).await;
            if n == 1 {
                Err("disk full".to_string())
            } else {
                Ok(n)
            }
        })
        .boxed()
    };

    let out = batch(steady_source(start, 30, 3), worker);
    let results: Vec<_> = out.collect().await;

    assert_eq!(
        results,
        vec![Ok(0), Err(BatchError::Worker("disk full".to_string()))]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    // Items buffered behind the failed batch were never dispatched.
    assert!(dispatched.lock().unwrap().len() < 30);
}

#[tokio::test(start_paused = true)]
async fn source_failure_cancels_running_worker() {
    init_logging();
    let start = Instant::now();
    let worker_finished = Arc::new(AtomicBool::new(false));
    let worker_dropped = Arc::new(AtomicBool::new(false));
    let (finished, dropped) = (worker_finished.clone(), worker_dropped.clone());

    let source = stream::iter(vec![Ok(1u32), Err("upstream closed".to_string())])
        .then(|next| async move {
            sleep(ms(10)).await;
            next
        })
        .boxed();
    let worker = move |_batch: Batch<u32>| {
        let guard = DropFlag(dropped.clone());
        let finished = finished.clone();
        stream::once(async move {
            let _guard = guard;
            sleep(ms(100)).await;
            finished.store(true, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .boxed()
    };

    let results: Vec<_> = batch(source, worker).collect().await;

    assert_eq!(
        results,
        vec![Err(BatchError::Source("upstream closed".to_string()))]
    );
    assert!(worker_dropped.load(Ordering::SeqCst));
    assert!(!worker_finished.load(Ordering::SeqCst));
    assert_eq!(tick(start, Instant::now()), 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_output_cancels_source_and_worker() {
    init_logging();
    let source_dropped = Arc::new(AtomicBool::new(false));
    let worker_dropped = Arc::new(AtomicBool::new(false));
    let consumed = Arc::new(AtomicUsize::new(0));

    let guard = DropFlag(source_dropped.clone());
    let counter = consumed.clone();
    let source = stream::unfold((0u32, guard), move |(n, guard)| {
        let counter = counter.clone();
        async move {
            sleep(ms(1)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Some((Ok::<_, String>(n), (n + 1, guard)))
        }
    });

    let dropped = worker_dropped.clone();
    let mut out = batch(source, move |batch: Batch<u32>| {
        let guard = DropFlag(dropped.clone());
        let first = batch[0];
        stream::once(async move {
            let _guard = guard;
            if first > 0 {
                // Second invocation never finishes on its own.
                std::future::pending::<()>().await;
            }
            sleep(ms(5)).await;
            Ok(first)
        })
        .boxed()
    });

    assert_eq!(out.next().await, Some(Ok(0)));
    worker_dropped.store(false, Ordering::SeqCst);
    sleep(ms(20)).await;
    drop(out);
    sleep(ms(20)).await;

    assert!(source_dropped.load(Ordering::SeqCst));
    assert!(worker_dropped.load(Ordering::SeqCst));
    let after_drop = consumed.load(Ordering::SeqCst);
    sleep(ms(50)).await;
    assert_eq!(consumed.load(Ordering::SeqCst), after_drop);
}

#[tokio::test(start_paused = true)]
async fn stats_track_the_run() {
    let start = Instant::now();
    let rec = Recorder::new(start);

    let out = batch(steady_source(start, 40, 1), rec.sleeping_worker(ms(9)));
    let stats = out.stats();
    let _: Vec<_> = out.collect().await;

    let batches = rec.batches();
    assert_eq!(stats.items(), 40);
    assert_eq!(stats.batches(), batches.len());
    assert_eq!(stats.results(), batches.len());
    assert_eq!(
        stats.largest_batch(),
        batches.iter().map(Vec::len).max().unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn independent_runs_share_nothing() {
    let start = Instant::now();
    let (a, b) = (Recorder::new(start), Recorder::new(start));

    let run_a = batch(steady_source(start, 30, 1), a.sleeping_worker(ms(5)));
    let run_b = batch(steady_source(start, 30, 1), b.sleeping_worker(ms(5)));
    let (ra, rb): (Vec<_>, Vec<_>) = tokio::join!(run_a.collect(), run_b.collect());

    assert!(ra.iter().chain(rb.iter()).all(|r| r.is_ok()));
    assert_eq!(a.max_in_flight(), 1);
    assert_eq!(b.max_in_flight(), 1);
    assert_eq!(a.batches().concat(), (0..30).collect::<Vec<_>>());
    assert_eq!(b.batches().concat(), (0..30).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn marble_trailing_worker_completion() {
    init_logging();
    let start = Instant::now();

    // source: aa---aaaaaa-a-a-a-a-aaa------a|
    // worker: ---b|
    let marble = "aa---aaaaaa-a-a-a-a-aaa------a|";
    let items: Vec<(u64, u32)> = marble
        .char_indices()
        .filter(|&(_, c)| c == 'a')
        .map(|(t, _)| (t as u64 * TICK_MS, t as u32))
        .collect();
    let done_at = marble.find('|').unwrap() as u64 * TICK_MS;
    let dispatched = Arc::new(Mutex::new(Vec::new()));
    let seen = dispatched.clone();

    let out = timed_source(start, items.clone(), done_at).batch(move |batch: Batch<u32>| {
        seen.lock().unwrap().extend(batch.iter().copied());
        stream::once(async {
            sleep(ms(3 * TICK_MS)).await;
            Ok::<_, String>('b')
        })
        // Stream stays open one tick after its last result.
        .chain(
            stream::once(async { sleep(ms(TICK_MS)).await })
                .filter_map(|()| async { None }),
        )
        .boxed()
    });
    let emitted: Vec<u64> = out
        .map(|r| {
            assert_eq!(r, Ok('b'));
            tick(start, Instant::now())
        })
        .collect()
        .await;

    assert_eq!(emitted, vec![3, 7, 11, 15, 19, 23, 27, 32]);
    assert_eq!(tick(start, Instant::now()), 33);
    let expected: Vec<u32> = items.iter().map(|&(_, item)| item).collect();
    assert_eq!(*dispatched.lock().unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn worker_fn_panic_is_resumed_downstream() {
    init_logging();
    let start = Instant::now();

    let out = batch(
        steady_source(start, 5, 10),
        |_batch: Batch<u32>| -> BoxStream<'static, Result<u32, String>> {
            panic!("worker fn exploded")
        },
    );
    let caught = timeout(ms(1_000), AssertUnwindSafe(out.collect::<Vec<_>>()).catch_unwind())
        .await
        .expect("output must end");

    let payload = caught.expect_err("a panicking worker must not look like success");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"worker fn exploded"));
}

fn exploding_result() -> Result<u32, String> {
    panic!("worker stream exploded")
}

#[tokio::test(start_paused = true)]
async fn worker_stream_panic_ends_the_output() {
    init_logging();
    let start = Instant::now();

    let out = batch(steady_source(start, 5, 10), |_batch: Batch<u32>| {
        stream::once(async {
            sleep(ms(5)).await;
            exploding_result()
        })
        .boxed()
    });
    let caught = timeout(ms(1_000), AssertUnwindSafe(out.collect::<Vec<_>>()).catch_unwind())
        .await
        .expect("output must end");

    let payload = caught.expect_err("a panicking worker stream must not look like success");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"worker stream exploded"));
}

#[tokio::test(start_paused = true)]
async fn source_panic_cancels_worker_and_ends_the_output() {
    init_logging();
    let worker_dropped = Arc::new(AtomicBool::new(false));
    let dropped = worker_dropped.clone();

    let source = stream::iter(0..3u32).then(|n| async move {
        sleep(ms(10)).await;
        if n == 1 {
            panic!("source exploded");
        }
        Ok::<_, String>(n)
    });
    let out = batch(source, move |_batch: Batch<u32>| {
        let guard = DropFlag(dropped.clone());
        stream::once(async move {
            let _guard = guard;
            sleep(ms(100)).await;
            Ok::<_, String>(())
        })
        .boxed()
    });
    let caught = timeout(ms(1_000), AssertUnwindSafe(out.collect::<Vec<_>>()).catch_unwind())
        .await
        .expect("output must end");

    let payload = caught.expect_err("a panicking source must not look like success");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"source exploded"));
    assert!(worker_dropped.load(Ordering::SeqCst));
}
