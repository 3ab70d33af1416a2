use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use cso_core::Progress;

const BAR_WIDTH: u64 = 40;

/// `Progress: [#####-----]  12.5%` on stderr, redrawn in place.
///
/// Only redraws when the per-mille value changes, so decoding a large image
/// on many threads does not flood the terminal.
pub struct ProgressBar {
    last_permille: AtomicU64,
}

impl ProgressBar {
    pub fn new() -> Self {
        Self {
            last_permille: AtomicU64::new(u64::MAX),
        }
    }

    /// End the bar's line.
    pub fn finish(&self) {
        eprintln!();
    }
}

impl Default for ProgressBar {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ProgressBar {
    fn update(&self, done: u64, total: u64) {
        if total == 0 {
            return;
        }
        let permille = done.min(total) * 1000 / total;
        if self.last_permille.swap(permille, Ordering::Relaxed) == permille {
            return;
        }
        let filled = (BAR_WIDTH * permille / 1000) as usize;
        let mut stderr = std::io::stderr().lock();
        let _ = write!(
            stderr,
            "\rProgress: [{}{}] {:5.1}%",
            "#".repeat(filled),
            "-".repeat(BAR_WIDTH as usize - filled),
            permille as f64 / 10.0
        );
        let _ = stderr.flush();
    }
}
