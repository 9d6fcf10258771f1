//! Progress reporting for TTY and non-TTY environments.
//!
//! TTY mode: an indicatif bar counting items handed to workers.
//! Non-TTY mode: hidden bar, logs are the only progress indicator.

use std::io::IsTerminal;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

fn items_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:<10.cyan.bold} {bar:30.green/dim} {pos:>7}/{len:7} {elapsed:>4} {wide_msg:.dim}")
        .expect("invalid template")
        .progress_chars("--")
}

pub struct ProgressContext {
    multi: MultiProgress,
    is_tty: bool,
}

impl ProgressContext {
    /// Create new context, detecting TTY automatically.
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            is_tty: std::io::stderr().is_terminal(),
        }
    }

    /// Bar counting dispatched items out of `total`; hidden off a TTY.
    pub fn items_bar(&self, label: &str, total: u64) -> ProgressBar {
        if !self.is_tty {
            return ProgressBar::hidden();
        }
        let pb = self.multi.add(ProgressBar::new(total));
        pb.set_style(items_style());
        pb.set_prefix(label.to_string());
        pb
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    /// Get reference to `MultiProgress` for the log bridge.
    pub fn multi(&self) -> &MultiProgress {
        &self.multi
    }
}

impl Default for ProgressContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Format number with thousand separators.
pub fn fmt_num(n: usize) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (i + 3 - lead) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
