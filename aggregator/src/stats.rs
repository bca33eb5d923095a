use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one kind of call. Purely observational: nothing
/// reads them to make a decision.
#[derive(Debug, Default)]
pub struct KindCounters {
    /// Calls received from callers.
    pub total_called: AtomicU64,
    /// Transport calls made by a flush/refresh pass.
    pub sent_by_flush: AtomicU64,
    /// Transport calls made synchronously on a caller's miss path.
    pub sent_in_flight: AtomicU64,
    /// Transport calls outstanding right now.
    pub in_flight: AtomicU64,
    /// Background transport calls that failed.
    pub flush_failures: AtomicU64,
    /// Report only: operations delivered to the transport.
    pub operations_sent: AtomicU64,
}

impl KindCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self) {
        self.total_called.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a transport call as outstanding until the guard drops.
    pub fn track_in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counters: self }
    }

    pub fn record_sync_send(&self) {
        self.sent_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_send(&self) {
        self.sent_by_flush.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operations_sent(&self, count: usize) {
        self.operations_sent
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cached_entries: usize, pending_calls: usize) -> KindStatistics {
        KindStatistics {
            total_called: self.total_called.load(Ordering::Relaxed),
            sent_by_flush: self.sent_by_flush.load(Ordering::Relaxed),
            sent_in_flight: self.sent_in_flight.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            operations_sent: self.operations_sent.load(Ordering::Relaxed),
            cached_entries,
            pending_calls,
        }
    }
}

pub struct InFlightGuard<'a> {
    counters: &'a KindCounters,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of one kind's counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KindStatistics {
    pub total_called: u64,
    pub sent_by_flush: u64,
    pub sent_in_flight: u64,
    pub in_flight: u64,
    pub flush_failures: u64,
    pub operations_sent: u64,
    pub cached_entries: usize,
    pub pending_calls: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    pub check: KindStatistics,
    pub quota: KindStatistics,
    pub report: KindStatistics,
}

impl Statistics {
    /// Entries still holding state that a final flush would send.
    pub fn entries_pending_flush(&self) -> usize {
        self.check.cached_entries + self.quota.cached_entries + self.report.cached_entries
    }
}

/// What one flush pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub sent: usize,
    pub failed: usize,
    pub expired: usize,
}

impl FlushSummary {
    pub fn absorb(&mut self, other: FlushSummary) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.expired += other.expired;
    }

    pub fn is_idle(&self) -> bool {
        self.sent == 0 && self.failed == 0 && self.expired == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard_restores_gauge() {
        let counters = KindCounters::new();
        {
            let _a = counters.track_in_flight();
            let _b = counters.track_in_flight();
            assert_eq!(counters.snapshot(0, 0).in_flight, 2);
        }
        assert_eq!(counters.snapshot(0, 0).in_flight, 0);
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let counters = KindCounters::new();
        counters.record_call();
        counters.record_call();
        counters.record_sync_send();
        counters.record_flush_send();
        counters.record_operations_sent(3);
        let snap = counters.snapshot(4, 1);
        assert_eq!(snap.total_called, 2);
        assert_eq!(snap.sent_in_flight, 1);
        assert_eq!(snap.sent_by_flush, 1);
        assert_eq!(snap.operations_sent, 3);
        assert_eq!(snap.cached_entries, 4);
        assert_eq!(snap.pending_calls, 1);
    }
}
