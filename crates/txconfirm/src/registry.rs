// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of pending confirmation waits for one collection.
//!
//! Every wait lives in a single map entry holding its completion channel.
//! Whoever removes the entry (a matching event, the timer, the abort
//! listener, stream shutdown) is the only one allowed to complete it, which
//! makes the terminal transition happen exactly once however those paths
//! race.
//!
//! `notify` evaluates matchers on a snapshot of the pending set taken before
//! any matcher runs, with no map lock held, so custom match functions may
//! register or cancel waits without deadlocking or disturbing the scan.

use crate::confirmation::{Confirmation, WaitOutcome};
use crate::error::{ConfirmError, PredicateError};
use crate::event::IncomingEvent;
use crate::matcher::{MatchReason, WaitMatcher};
use crate::stats::ConfirmationStats;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

/// Handle to a registered wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaitHandle(u64);

impl WaitHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait#{}", self.0)
    }
}

/// When a matching event confirms a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOn {
    /// As soon as the matching event is dispatched.
    #[default]
    Match,
    /// On the first up-to-date event after the match, once the whole
    /// server transaction has been applied.
    UpToDate,
}

/// A custom match function failed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateDiagnostic {
    pub collection_id: Option<String>,
    pub wait: WaitHandle,
    pub error: PredicateError,
}

/// What a single `notify` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Waits completed successfully by this call.
    pub resolved: usize,
    /// Waits matched but held back until the next up-to-date event.
    pub marked: usize,
    /// Matchers that failed on this event.
    pub predicate_failures: usize,
}

struct PendingWait {
    matcher: WaitMatcher,
    completion: oneshot::Sender<WaitOutcome>,
    // Set in `ConfirmOn::UpToDate` mode once a match was seen.
    matched: Option<Confirmation>,
}

/// Pending waits of one collection.
pub struct TransactionWaitRegistry {
    collection_id: Option<String>,
    confirm_on: ConfirmOn,
    next_id: AtomicU64,
    pending: DashMap<WaitHandle, PendingWait>,
    stats: Arc<ConfirmationStats>,
    diagnostics: broadcast::Sender<PredicateDiagnostic>,
}

impl TransactionWaitRegistry {
    pub fn new(
        collection_id: Option<String>,
        confirm_on: ConfirmOn,
        diagnostics_capacity: usize,
        stats: Arc<ConfirmationStats>,
    ) -> Self {
        let (diagnostics, _) = broadcast::channel(diagnostics_capacity.max(1));
        Self {
            collection_id,
            confirm_on,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            stats,
            diagnostics,
        }
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }

    pub fn confirm_on(&self) -> ConfirmOn {
        self.confirm_on
    }

    fn label(&self) -> &str {
        self.collection_id.as_deref().unwrap_or("-")
    }

    /// Insert a new pending wait.
    pub fn register(&self, matcher: WaitMatcher) -> (WaitHandle, oneshot::Receiver<WaitOutcome>) {
        let handle = WaitHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        tracing::debug!(
            collection = self.label(),
            %handle,
            txid = ?matcher.awaited_txid(),
            "registered wait"
        );
        self.pending.insert(
            handle,
            PendingWait {
                matcher,
                completion: tx,
                matched: None,
            },
        );
        ConfirmationStats::bump(&self.stats.registered);
        (handle, rx)
    }

    /// Dispatch one stream event to every pending wait.
    pub fn notify(&self, event: &Arc<IncomingEvent>) -> DispatchReport {
        ConfirmationStats::bump(&self.stats.events_dispatched);
        let mut report = DispatchReport::default();

        let candidates: Vec<(WaitHandle, WaitMatcher)> = self
            .pending
            .iter()
            .filter(|entry| entry.matched.is_none())
            .map(|entry| (*entry.key(), entry.matcher.clone()))
            .collect();

        let mut hits = Vec::new();
        for (handle, matcher) in candidates {
            match matcher.accepts(event) {
                Ok(Some(reason)) => hits.push((handle, confirmation_for(reason, event))),
                Ok(None) => {}
                Err(error) => {
                    report.predicate_failures += 1;
                    self.report_predicate_failure(handle, error);
                }
            }
        }

        match self.confirm_on {
            ConfirmOn::Match => {
                for (handle, confirmation) in hits {
                    if self.complete(handle, Ok(confirmation)) {
                        report.resolved += 1;
                    }
                }
            }
            ConfirmOn::UpToDate => {
                for (handle, confirmation) in hits {
                    if self.mark(handle, confirmation) {
                        report.marked += 1;
                    }
                }
                if event.is_up_to_date() {
                    report.resolved += self.resolve_marked();
                }
            }
        }

        if report.resolved > 0 || report.marked > 0 {
            tracing::debug!(
                collection = self.label(),
                resolved = report.resolved,
                marked = report.marked,
                "dispatched event"
            );
        }
        report
    }

    /// Complete every wait that matched and is waiting for up-to-date.
    pub fn resolve_marked(&self) -> usize {
        let marked: Vec<WaitHandle> = self
            .pending
            .iter()
            .filter(|entry| entry.matched.is_some())
            .map(|entry| *entry.key())
            .collect();

        let mut resolved = 0;
        for handle in marked {
            if let Some((_, mut wait)) = self.pending.remove(&handle) {
                if let Some(confirmation) = wait.matched.take() {
                    ConfirmationStats::bump(&self.stats.confirmed);
                    tracing::debug!(collection = self.label(), %handle, "resolved on up-to-date");
                    let _ = wait.completion.send(Ok(confirmation));
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Record a match to be confirmed by the next up-to-date event.
    ///
    /// Returns `false` if the wait already settled or was already marked.
    pub fn mark(&self, handle: WaitHandle, confirmation: Confirmation) -> bool {
        match self.pending.get_mut(&handle) {
            Some(mut wait) if wait.matched.is_none() => {
                wait.matched = Some(confirmation);
                true
            }
            _ => false,
        }
    }

    /// Complete a still-pending wait successfully.
    pub fn resolve(&self, handle: WaitHandle, confirmation: Confirmation) -> bool {
        self.complete(handle, Ok(confirmation))
    }

    /// Reject a still-pending wait. No-op if it already settled.
    pub fn cancel(&self, handle: WaitHandle, reason: ConfirmError) -> bool {
        self.complete(handle, Err(reason))
    }

    /// Drop a wait without completing it (its receiver is gone).
    pub fn remove(&self, handle: WaitHandle) -> bool {
        let removed = self.pending.remove(&handle).is_some();
        if removed {
            tracing::debug!(collection = self.label(), %handle, "wait dropped by caller");
        }
        removed
    }

    /// Reject every pending wait, building each error from its matcher.
    pub fn reject_all<F>(&self, reason: F) -> usize
    where
        F: Fn(&WaitMatcher) -> ConfirmError,
    {
        let handles: Vec<WaitHandle> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0;
        for handle in handles {
            if let Some((_, wait)) = self.pending.remove(&handle) {
                let error = reason(&wait.matcher);
                self.record_outcome(&Err(error.clone()));
                let _ = wait.completion.send(Err(error));
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, handle: WaitHandle) -> bool {
        self.pending.contains_key(&handle)
    }

    /// Whether a wait has matched and is held until the next up-to-date.
    pub fn is_marked(&self, handle: WaitHandle) -> bool {
        self.pending
            .get(&handle)
            .is_some_and(|wait| wait.matched.is_some())
    }

    /// Subscribe to predicate failure reports.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<PredicateDiagnostic> {
        self.diagnostics.subscribe()
    }

    fn complete(&self, handle: WaitHandle, outcome: WaitOutcome) -> bool {
        let Some((_, wait)) = self.pending.remove(&handle) else {
            return false;
        };
        match &outcome {
            Ok(_) => tracing::debug!(collection = self.label(), %handle, "wait confirmed"),
            Err(e) => tracing::debug!(collection = self.label(), %handle, error = %e, "wait rejected"),
        }
        self.record_outcome(&outcome);
        // The receiver may already be gone; the wait is settled either way.
        let _ = wait.completion.send(outcome);
        true
    }

    fn record_outcome(&self, outcome: &WaitOutcome) {
        let counter = match outcome {
            Ok(_) => &self.stats.confirmed,
            Err(e) => self.stats.rejection_counter(e),
        };
        ConfirmationStats::bump(counter);
    }

    pub(crate) fn report_predicate_failure(&self, handle: WaitHandle, error: PredicateError) {
        ConfirmationStats::bump(&self.stats.predicate_failures);
        tracing::warn!(
            collection = self.label(),
            %handle,
            error = %error,
            "match function failed, treating as no match"
        );
        // No subscribers is fine.
        let _ = self.diagnostics.send(PredicateDiagnostic {
            collection_id: self.collection_id.clone(),
            wait: handle,
            error,
        });
    }
}

impl fmt::Debug for TransactionWaitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionWaitRegistry")
            .field("collection_id", &self.collection_id)
            .field("confirm_on", &self.confirm_on)
            .field("pending", &self.pending.len())
            .finish()
    }
}

fn confirmation_for(reason: MatchReason, event: &Arc<IncomingEvent>) -> Confirmation {
    match reason {
        MatchReason::Event => Confirmation::Observed(Arc::clone(event)),
        MatchReason::Snapshot { txid, snapshot } => Confirmation::VisibleInSnapshot { txid, snapshot },
    }
}
