//! Global atomic counters for patchctl.
//!
//! Counters are incremented at the call site. Call [`Metrics::flush`] at a
//! natural boundary (end of a CLI command) to emit them as one event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    patches_applied: AtomicU64,
    patches_rolled_back: AtomicU64,
    files_consolidated: AtomicU64,
    issues_suppressed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            patches_applied: AtomicU64::new(0),
            patches_rolled_back: AtomicU64::new(0),
            files_consolidated: AtomicU64::new(0),
            issues_suppressed: AtomicU64::new(0),
        }
    }

    pub fn inc_patches_applied(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patches_applied", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.patches_rolled_back.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patches_rolled_back", "counter incremented");
    }

    /// Add `n` files to the consolidated counter.
    pub fn add_files_consolidated(&self, n: u64) {
        self.files_consolidated.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "files_consolidated", n, "counter incremented");
    }

    /// Count one failure report that was folded into an existing issue.
    pub fn inc_issues_suppressed(&self) {
        self.issues_suppressed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "issues_suppressed", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            patches_applied = self.patches_applied(),
            patches_rolled_back = self.patches_rolled_back(),
            files_consolidated = self.files_consolidated(),
            issues_suppressed = self.issues_suppressed(),
        );
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn patches_rolled_back(&self) -> u64 {
        self.patches_rolled_back.load(Ordering::Relaxed)
    }

    pub fn files_consolidated(&self) -> u64 {
        self.files_consolidated.load(Ordering::Relaxed)
    }

    pub fn issues_suppressed(&self) -> u64 {
        self.issues_suppressed.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.patches_applied.store(0, Ordering::Relaxed);
        self.patches_rolled_back.store(0, Ordering::Relaxed);
        self.files_consolidated.store(0, Ordering::Relaxed);
        self.issues_suppressed.store(0, Ordering::Relaxed);
    }
}
