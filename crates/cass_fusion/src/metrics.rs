//! In-process counters for foreign scans and the connection cache.
//!
//! Lock-free so they can be bumped on the per-row path.

use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregated counters shared by the cache, the scan controller and the
/// table provider.
#[derive(Debug, Default)]
pub struct ScanMetrics {
    /// Scans that reached the executing state.
    scans_begun: AtomicU64,
    /// Remote statements executed.
    remote_executes: AtomicU64,
    /// Remote executes that failed.
    remote_errors: AtomicU64,
    /// Rows materialized from remote results.
    rows_fetched: AtomicU64,
    /// Rows handed back to the caller.
    rows_returned: AtomicU64,
    rewinds: AtomicU64,
    /// Restriction clauses rendered into a remote `WHERE`.
    pushed_clauses: AtomicU64,
    /// Restriction clauses left for local evaluation only.
    skipped_clauses: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    connect_failures: AtomicU64,
}

/// Immutable snapshot view of [`ScanMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanMetricsSnapshot {
    pub scans_begun: u64,
    pub remote_executes: u64,
    pub remote_errors: u64,
    pub rows_fetched: u64,
    pub rows_returned: u64,
    pub rewinds: u64,
    pub pushed_clauses: u64,
    pub skipped_clauses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub connect_failures: u64,
}

impl ScanMetrics {
    pub fn record_scan_begin(&self) {
        self.scans_begun.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one remote execute and, on success, how many rows it produced.
    pub fn record_execute(&self, rows: Option<u64>) {
        self.remote_executes.fetch_add(1, Ordering::Relaxed);
        match rows {
            Some(rows) => {
                self.rows_fetched.fetch_add(rows, Ordering::Relaxed);
            }
            None => {
                self.remote_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_row_returned(&self) {
        self.rows_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rewind(&self) {
        self.rewinds.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of translating one restriction list.
    pub fn record_pushdown(&self, pushed: u64, skipped: u64) {
        self.pushed_clauses.fetch_add(pushed, Ordering::Relaxed);
        self.skipped_clauses.fetch_add(skipped, Ordering::Relaxed);
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScanMetricsSnapshot {
        ScanMetricsSnapshot {
            scans_begun: self.scans_begun.load(Ordering::Relaxed),
            remote_executes: self.remote_executes.load(Ordering::Relaxed),
            remote_errors: self.remote_errors.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            rows_returned: self.rows_returned.load(Ordering::Relaxed),
            rewinds: self.rewinds.load(Ordering::Relaxed),
            pushed_clauses: self.pushed_clauses.load(Ordering::Relaxed),
            skipped_clauses: self.skipped_clauses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    /// Renders metrics as `name=value` lines.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "scans_begun={}\nremote_executes={}\nremote_errors={}\nrows_fetched={}\nrows_returned={}\nrewinds={}\npushed_clauses={}\nskipped_clauses={}\nconnection_cache_hits={}\nconnection_cache_misses={}\nconnect_failures={}\n",
            s.scans_begun,
            s.remote_executes,
            s.remote_errors,
            s.rows_fetched,
            s.rows_returned,
            s.rewinds,
            s.pushed_clauses,
            s.skipped_clauses,
            s.cache_hits,
            s.cache_misses,
            s.connect_failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_outcomes_are_split() {
        let metrics = ScanMetrics::default();
        metrics.record_execute(Some(3));
        metrics.record_execute(None);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.remote_executes, 2);
        assert_eq!(snapshot.remote_errors, 1);
        assert_eq!(snapshot.rows_fetched, 3);
    }

    #[test]
    fn render_text_lists_every_counter() {
        let metrics = ScanMetrics::default();
        metrics.record_cache_lookup(true);
        metrics.record_cache_lookup(false);
        metrics.record_pushdown(2, 1);
        let text = metrics.render_text();
        assert!(text.contains("connection_cache_hits=1\n"));
        assert!(text.contains("connection_cache_misses=1\n"));
        assert!(text.contains("pushed_clauses=2\n"));
        assert!(text.contains("skipped_clauses=1\n"));
        assert_eq!(text.lines().count(), 11);
    }
}
