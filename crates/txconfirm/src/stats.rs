// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-collection confirmation statistics.

use crate::error::{ConfirmError, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Live counters, updated by the registry and the collection.
#[derive(Debug)]
pub struct ConfirmationStats {
    /// Waits registered.
    pub registered: AtomicU64,
    /// Waits confirmed (from the stream, the seen cache, or a snapshot).
    pub confirmed: AtomicU64,
    /// Waits rejected by their deadline.
    pub timed_out: AtomicU64,
    /// Waits rejected by an abort signal or stream shutdown.
    pub aborted: AtomicU64,
    /// Txids refused before registration (not a non-negative integer).
    pub invalid_txids: AtomicU64,
    /// Custom match functions that errored or panicked.
    pub predicate_failures: AtomicU64,
    /// Events dispatched to the registry.
    pub events_dispatched: AtomicU64,
    /// Events addressed to another collection.
    pub events_ignored: AtomicU64,
    created: Instant,
}

impl ConfirmationStats {
    pub fn new() -> Self {
        Self {
            registered: AtomicU64::new(0),
            confirmed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            invalid_txids: AtomicU64::new(0),
            predicate_failures: AtomicU64::new(0),
            events_dispatched: AtomicU64::new(0),
            events_ignored: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter a rejection is recorded under.
    pub(crate) fn rejection_counter(&self, error: &ConfirmError) -> &AtomicU64 {
        match error.kind() {
            ErrorKind::Timeout => &self.timed_out,
            ErrorKind::Cancellation => &self.aborted,
            ErrorKind::Precondition => &self.invalid_txids,
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> ConfirmationStatsSnapshot {
        ConfirmationStatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            confirmed: self.confirmed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            invalid_txids: self.invalid_txids.load(Ordering::Relaxed),
            predicate_failures: self.predicate_failures.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_ignored: self.events_ignored.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for ConfirmationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of confirmation statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfirmationStatsSnapshot {
    pub registered: u64,
    pub confirmed: u64,
    pub timed_out: u64,
    pub aborted: u64,
    pub invalid_txids: u64,
    pub predicate_failures: u64,
    pub events_dispatched: u64,
    pub events_ignored: u64,
    pub uptime_secs: u64,
}

impl ConfirmationStatsSnapshot {
    /// Registered waits that reached a terminal state. Invalid txids never
    /// register and are not included.
    pub fn settled(&self) -> u64 {
        self.confirmed + self.timed_out + self.aborted
    }

    /// Waits still outstanding (registered minus settled). Waits dropped by
    /// their caller before settling are included.
    pub fn outstanding(&self) -> u64 {
        self.registered.saturating_sub(self.settled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_counter_by_kind() {
        let stats = ConfirmationStats::new();
        let timeout = ConfirmError::TimeoutMatch { collection_id: None };
        let aborted = ConfirmError::Aborted { collection_id: None };
        let invalid = ConfirmError::InvalidTxIdType {
            received: "string".into(),
            collection_id: None,
        };
        assert!(std::ptr::eq(stats.rejection_counter(&timeout), &stats.timed_out));
        assert!(std::ptr::eq(stats.rejection_counter(&aborted), &stats.aborted));
        assert!(std::ptr::eq(stats.rejection_counter(&invalid), &stats.invalid_txids));
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ConfirmationStats::new();
        ConfirmationStats::bump(&stats.registered);
        ConfirmationStats::bump(&stats.registered);
        ConfirmationStats::bump(&stats.registered);
        ConfirmationStats::bump(&stats.confirmed);
        ConfirmationStats::bump(&stats.timed_out);

        let snap = stats.snapshot();
        assert_eq!(snap.registered, 3);
        assert_eq!(snap.settled(), 2);
        assert_eq!(snap.outstanding(), 1);
        assert_eq!(snap.predicate_failures, 0);

        ConfirmationStats::bump(&stats.invalid_txids);
        let snap = stats.snapshot();
        assert_eq!(snap.invalid_txids, 1);
        assert_eq!(snap.settled(), 2);
    }
}
