//! Simulate subcommand - run the batching operator against a synthetic
//! source and worker and report how items were grouped.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use batchflow_core::{Batch, BatchExt, RetryPolicy, retry_with_backoff};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use futures_util::{Stream, StreamExt, stream};
use indicatif::ProgressBar;
use tokio::time::Instant;

use crate::config::Config;
use crate::progress::{ProgressContext, fmt_num};

#[derive(Args, Debug, Default)]
pub struct SimulateArgs {
    /// Number of items the source emits
    #[arg(short = 'n', long)]
    pub items: Option<usize>,

    /// Milliseconds between source items
    #[arg(short, long)]
    pub interval_ms: Option<u64>,

    /// Milliseconds each worker attempt takes
    #[arg(short, long)]
    pub worker_ms: Option<u64>,

    /// Results each worker invocation emits
    #[arg(short, long)]
    pub results_per_batch: Option<usize>,

    /// Fail every Nth worker attempt (0 disables)
    #[arg(long)]
    pub flaky_every: Option<usize>,

    /// Retries per batch before the run fails
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Effective settings: config file defaults, CLI overrides
#[derive(Debug, Clone)]
struct Settings {
    items: usize,
    interval: Duration,
    worker: Duration,
    results_per_batch: usize,
    flaky_every: Option<usize>,
    retry: RetryPolicy,
}

impl Settings {
    fn resolve(args: &SimulateArgs, config: &Config) -> Self {
        let sim = &config.simulate;
        let mut retry = config.retry.policy();
        if let Some(n) = args.max_retries {
            retry.max_retries = n;
        }
        Self {
            items: args.items.unwrap_or(sim.items),
            interval: Duration::from_millis(args.interval_ms.unwrap_or(sim.interval_ms)),
            worker: Duration::from_millis(args.worker_ms.unwrap_or(sim.worker_ms)),
            results_per_batch: args.results_per_batch.unwrap_or(sim.results_per_batch),
            flaky_every: args.flaky_every.or(sim.flaky_every).filter(|&n| n > 0),
            retry,
        }
    }
}

/// One worker result: part `part` of the batch starting at item `first`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Report {
    first: usize,
    len: usize,
    part: usize,
}

#[derive(Debug)]
struct Summary {
    emitted: usize,
    batches: usize,
    items: usize,
    largest_batch: usize,
    mean_batch: f64,
    results: usize,
    attempts: usize,
    elapsed: Duration,
    interrupted: bool,
}

pub fn run(args: SimulateArgs, config: &Config, progress: &ProgressContext) -> Result<()> {
    let settings = Settings::resolve(&args, config);
    log::info!(
        "Simulating {} items every {:?}, worker {:?} per batch",
        fmt_num(settings.items),
        settings.interval,
        settings.worker
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let bar = progress.items_bar("simulate", settings.items as u64);
    let outcome = rt.block_on(simulate(&settings, &bar, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Cannot listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    }));
    bar.finish_and_clear();

    let summary = outcome?;
    if summary.interrupted {
        log::warn!("Interrupted, run cancelled");
    }
    print_summary(&summary);
    Ok(())
}

/// Source emitting `0..items`, one every `interval`
fn source(items: usize, interval: Duration) -> impl Stream<Item = Result<usize>> + Send + 'static {
    stream::iter(0..items).then(move |i| async move {
        tokio::time::sleep(interval).await;
        Ok(i)
    })
}

/// Drive one run until the stream ends, fails, or `shutdown` resolves
async fn simulate(
    settings: &Settings,
    bar: &ProgressBar,
    shutdown: impl Future<Output = ()>,
) -> Result<Summary> {
    let started = Instant::now();
    let attempts = Arc::new(AtomicUsize::new(0));

    let worker = {
        let attempts = attempts.clone();
        let delay = settings.worker;
        let flaky_every = settings.flaky_every;
        let per_batch = settings.results_per_batch;
        let policy = settings.retry;
        move |batch: Batch<usize>| {
            let attempts = attempts.clone();
            let first = batch.first().copied().unwrap_or_default();
            let len = batch.len();
            let work = async move {
                let label = format!("batch@{first}");
                retry_with_backoff(
                    &label,
                    &policy,
                    |_: &anyhow::Error| true,
                    || {
                        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                        async move {
                            tokio::time::sleep(delay).await;
                            match flaky_every {
                                Some(n) if attempt % n == 0 => {
                                    Err(anyhow!("simulated failure on attempt {attempt}"))
                                }
                                _ => Ok(len),
                            }
                        }
                    },
                )
                .await
            };
            stream::once(work).flat_map(move |outcome| {
                let reports: Vec<Result<Report>> = match outcome {
                    Ok(len) => (0..per_batch)
                        .map(|part| Ok(Report { first, len, part }))
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(reports)
            })
        }
    };

    let mut batched = source(settings.items, settings.interval).batch(worker);
    let stats = batched.stats();
    let mut interrupted = false;
    let mut failure = None;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            next = batched.next() => match next {
                Some(Ok(report)) => {
                    if report.part == 0 {
                        log::debug!("Batch of {} starting at item {}", report.len, report.first);
                    }
                    bar.set_position(stats.items() as u64);
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            },
            () = &mut shutdown => {
                interrupted = true;
                break;
            }
        }
    }
    // Cancels source and worker if still running
    drop(batched);

    if let Some(e) = failure {
        let side = if e.is_worker() { "Worker" } else { "Source" };
        return Err(e.into_inner().context(format!("{side} failed")));
    }

    Ok(Summary {
        emitted: settings.items,
        batches: stats.batches(),
        items: stats.items(),
        largest_batch: stats.largest_batch(),
        mean_batch: stats.mean_batch_size(),
        results: stats.results(),
        attempts: attempts.load(Ordering::Relaxed),
        elapsed: started.elapsed(),
        interrupted,
    })
}

fn print_summary(summary: &Summary) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Metric").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec![
        "Items",
        &format!("{} / {}", fmt_num(summary.items), fmt_num(summary.emitted)),
    ]);
    table.add_row(vec!["Batches", &fmt_num(summary.batches)]);
    table.add_row(vec!["Largest batch", &fmt_num(summary.largest_batch)]);
    table.add_row(vec!["Mean batch", &format!("{:.2}", summary.mean_batch)]);
    table.add_row(vec!["Results", &fmt_num(summary.results)]);
    table.add_row(vec!["Worker attempts", &fmt_num(summary.attempts)]);
    table.add_row(vec!["Elapsed", &format!("{:.2?}", summary.elapsed)]);
    if summary.interrupted {
        table.add_row(vec![
            Cell::new("Status"),
            Cell::new("interrupted").fg(Color::Yellow),
        ]);
    }

    eprintln!("\n{table}");
}
