//! Side-channel counters shared by the write facade and the forwarder.
//!
//! Failures never surface to the instrumented caller, so these counters are
//! the only place a degraded store or collector becomes visible. Rendered as
//! plain text for `GET /metrics`.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic process-local counters. All methods are lock-free.
#[derive(Debug, Default)]
pub struct Counters {
    /// Accepted writes (log append succeeded).
    pub writes: AtomicU64,
    /// Writes rejected at the validation boundary.
    pub write_rejections: AtomicU64,
    /// Log append failures.
    pub log_failures: AtomicU64,
    /// Indexed-store apply failures (log succeeded, index lagged).
    pub index_failures: AtomicU64,
    /// Successful collector deliveries.
    pub deliveries: AtomicU64,
    /// Failed delivery attempts.
    pub delivery_failures: AtomicU64,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_writes(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_write_rejections(&self) {
        self.write_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_log_failures(&self) {
        self.log_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_index_failures(&self) {
        self.index_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_deliveries(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_delivery_failures(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One `name value` line per counter.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, value) in [
            ("runledger_writes_total", &self.writes),
            ("runledger_write_rejections_total", &self.write_rejections),
            ("runledger_log_failures_total", &self.log_failures),
            ("runledger_index_failures_total", &self.index_failures),
            ("runledger_deliveries_total", &self.deliveries),
            ("runledger_delivery_failures_total", &self.delivery_failures),
        ] {
            let _ = writeln!(out, "{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_counter() {
        let counters = Counters::new();
        counters.incr_writes();
        counters.incr_writes();
        counters.incr_delivery_failures();

        let text = counters.render();
        assert!(text.contains("runledger_writes_total 2"));
        assert!(text.contains("runledger_delivery_failures_total 1"));
        assert!(text.contains("runledger_index_failures_total 0"));
        assert_eq!(text.lines().count(), 6);
    }
}
