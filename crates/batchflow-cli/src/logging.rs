//! Logging setup that cooperates with progress bars

use anyhow::{Context, Result};
use indicatif::MultiProgress;

fn level_label(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    }
}

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    }
}

/// Logger that prints above the progress bars instead of through them.
pub struct ProgressLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl log::Log for ProgressLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.inner.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let line = format!(
            "[{}{}\x1b[0m] {}",
            level_color(level),
            level_label(level),
            record.args()
        );
        self.multi.suspend(|| eprintln!("{line}"));
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Default filter: `debug` with `--debug`, otherwise `warn` on a TTY (the bar
/// shows activity) and `info` elsewhere. `RUST_LOG` overrides both.
fn default_level(debug: bool, tty: bool) -> &'static str {
    if debug {
        "debug"
    } else if tty {
        "warn"
    } else {
        "info"
    }
}

/// Install the global logger; pass the `MultiProgress` when bars are drawn
pub fn init_logging(debug: bool, multi: Option<&MultiProgress>) -> Result<()> {
    use std::io::Write;

    let env = env_logger::Env::default().default_filter_or(default_level(debug, multi.is_some()));

    match multi {
        Some(multi) => {
            let inner = env_logger::Builder::from_env(env).build();
            let max_level = inner.filter();
            log::set_boxed_logger(Box::new(ProgressLogger {
                inner,
                multi: multi.clone(),
            }))
            .context("logger already initialized")?;
            log::set_max_level(max_level);
        }
        None => {
            // Plain lines for log aggregation
            env_logger::Builder::from_env(env)
                .format(|buf, record| {
                    writeln!(buf, "[{}] {}", level_label(record.level()), record.args())
                })
                .try_init()
                .context("logger already initialized")?;
        }
    }
    Ok(())
}
