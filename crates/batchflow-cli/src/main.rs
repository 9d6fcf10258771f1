//! batchflow - adaptive batching playground
//!
//! Runs the batching operator against a synthetic source and worker so the
//! effect of source rate, worker latency and retries on batch sizes can be
//! observed from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;
mod logging;
mod progress;

use config::Config;
use progress::ProgressContext;

#[derive(Parser)]
#[command(name = "batchflow")]
#[command(about = "Adaptive batching with single-flight backpressure")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./batchflow.toml or ~/.config/batchflow/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Batch a synthetic source through a slow worker
    Simulate(cmd::simulate::SimulateArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let progress = ProgressContext::new();
    let multi = progress.is_tty().then(|| progress.multi());
    logging::init_logging(cli.debug, multi)?;

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Simulate(args) => cmd::simulate::run(args, &config, &progress),
        Command::Config => {
            use comfy_table::{
                Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
            };

            let sim = &config.simulate;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Setting").fg(Color::Cyan),
                    Cell::new("Value").fg(Color::Cyan),
                ]);

            table.add_row(vec!["Items", &sim.items.to_string()]);
            table.add_row(vec!["Source interval", &format!("{}ms", sim.interval_ms)]);
            table.add_row(vec!["Worker latency", &format!("{}ms", sim.worker_ms)]);
            table.add_row(vec![
                "Results per batch",
                &sim.results_per_batch.to_string(),
            ]);
            table.add_row(vec![
                "Flaky every",
                &sim.flaky_every
                    .map_or_else(|| "never".to_string(), |n| format!("{n} attempts")),
            ]);
            table.add_row(vec!["Max retries", &config.retry.max_retries.to_string()]);
            table.add_row(vec![
                "Backoff",
                &format!(
                    "{}ms (max: {}ms)",
                    config.retry.base_delay_ms, config.retry.max_delay_ms
                ),
            ]);

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
