use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::types::OverallStatus;

/// Aggregate counters for the run. Relaxed ordering throughout; these are
/// statistics, not synchronisation.
#[derive(Debug, Default)]
pub struct Stats {
    pub detected: AtomicU64,
    pub no_ci_found: AtomicU64,
    pub detection_failed: AtomicU64,
    pub migrated: AtomicU64,
    pub migration_failed: AtomicU64,
    pub lint_passed: AtomicU64,
    pub lint_failed: AtomicU64,
    pub double_check_passed: AtomicU64,
    pub double_check_failed: AtomicU64,
    pub double_check_skipped: AtomicU64,
    pub repairs: AtomicU64,
    pub prs_created: AtomicU64,
    pub prs_skipped: AtomicU64,
    pub prs_failed: AtomicU64,
    pub rows: AtomicU64,
    pub success: AtomicU64,
    pub partial: AtomicU64,
    pub failed: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Console progress: one bar over input repositories plus the stat block.
/// Shared by both tiers; all methods are callable from any thread.
pub struct Progress {
    bar: ProgressBar,
    pub stats: Stats,
}

impl Progress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self {
            bar,
            stats: Stats::default(),
        }
    }

    pub fn set_total(&self, repos: u64) {
        self.bar.set_length(repos);
    }

    /// Show which repository/stage a worker is on right now.
    pub fn set_current(&self, what: &str, stage: &str) {
        self.bar.set_message(format!("{what}: {stage}"));
    }

    pub fn repo_done(&self) {
        self.bar.inc(1);
    }

    /// Record a finalised row. `runtime_pending` rows are recorded later,
    /// when their update lands.
    pub fn record_row(&self, status: OverallStatus) {
        Stats::bump(&self.stats.rows);
        match status {
            OverallStatus::Success => Stats::bump(&self.stats.success),
            OverallStatus::Partial => Stats::bump(&self.stats.partial),
            OverallStatus::Failed => Stats::bump(&self.stats.failed),
            OverallStatus::Pending | OverallStatus::RuntimePending => {}
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
        let s = &self.stats;
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        info!(
            rows = get(&s.rows),
            success = get(&s.success),
            partial = get(&s.partial),
            failed = get(&s.failed),
            prs_created = get(&s.prs_created),
            repairs = get(&s.repairs),
            "pipeline finished"
        );
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}
