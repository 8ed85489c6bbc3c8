// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Acceptance tests applied to incoming events.

use crate::error::PredicateError;
use crate::event::{IncomingEvent, Txid};
use crate::snapshot::PgSnapshot;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type PredicateFn = dyn Fn(&IncomingEvent) -> Result<bool, PredicateError> + Send + Sync;

/// Custom match function, shared between the caller and the registry.
#[derive(Clone)]
pub struct Predicate(Arc<PredicateFn>);

impl Predicate {
    /// Wrap an infallible predicate.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&IncomingEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(move |event| Ok(f(event))))
    }

    /// Wrap a predicate that can fail; a failure counts as "no match".
    pub fn fallible<F, E>(f: F) -> Self
    where
        F: Fn(&IncomingEvent) -> Result<bool, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self(Arc::new(move |event| {
            f(event).map_err(|e| PredicateError::errored(e.to_string()))
        }))
    }

    /// Evaluate against one event. Panics are caught and reported as errors.
    pub fn evaluate(&self, event: &IncomingEvent) -> Result<bool, PredicateError> {
        match catch_unwind(AssertUnwindSafe(|| (self.0)(event))) {
            Ok(result) => result,
            Err(payload) => Err(PredicateError::panicked(payload.as_ref())),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// How a pending wait decides that an event confirms it.
#[derive(Debug, Clone)]
pub enum WaitMatcher {
    /// The event carries this txid, or is a snapshot-end whose snapshot
    /// makes it visible.
    ByTransactionId(Txid),
    /// The custom function returns `true`.
    ByPredicate(Predicate),
}

/// Why a matcher accepted an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchReason {
    /// Event carried the txid, or the predicate accepted it.
    Event,
    /// Snapshot-end event whose snapshot makes the txid visible.
    Snapshot { txid: Txid, snapshot: PgSnapshot },
}

impl WaitMatcher {
    pub fn txid(txid: Txid) -> Self {
        Self::ByTransactionId(txid)
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&IncomingEvent) -> bool + Send + Sync + 'static,
    {
        Self::ByPredicate(Predicate::new(f))
    }

    /// `Ok(None)` means the event does not match.
    pub fn accepts(&self, event: &IncomingEvent) -> Result<Option<MatchReason>, PredicateError> {
        match self {
            Self::ByTransactionId(txid) => {
                if event.carries_txid(*txid) {
                    return Ok(Some(MatchReason::Event));
                }
                Ok(event
                    .snapshot()
                    .filter(|snap| snap.is_visible(*txid))
                    .map(|snap| MatchReason::Snapshot {
                        txid: *txid,
                        snapshot: snap.clone(),
                    }))
            }
            Self::ByPredicate(predicate) => Ok(predicate
                .evaluate(event)?
                .then_some(MatchReason::Event)),
        }
    }

    /// The awaited txid, for txid matchers.
    pub fn awaited_txid(&self) -> Option<Txid> {
        match self {
            Self::ByTransactionId(txid) => Some(*txid),
            Self::ByPredicate(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PredicateFailure;
    use serde_json::json;

    #[test]
    fn test_txid_matcher_exact_equality() {
        let m = WaitMatcher::txid(42);
        let hit = IncomingEvent::insert(json!({})).with_txid(42);
        let miss = IncomingEvent::insert(json!({})).with_txid(41);
        assert_eq!(m.accepts(&hit), Ok(Some(MatchReason::Event)));
        assert_eq!(m.accepts(&miss), Ok(None));
        assert_eq!(m.awaited_txid(), Some(42));
    }

    #[test]
    fn test_txid_matcher_snapshot_visibility() {
        let snap = PgSnapshot::new(50, 60, vec![55]);
        let m = WaitMatcher::txid(52);
        assert_eq!(
            m.accepts(&IncomingEvent::snapshot_end(snap.clone())),
            Ok(Some(MatchReason::Snapshot {
                txid: 52,
                snapshot: snap.clone(),
            }))
        );

        let in_progress = WaitMatcher::txid(55);
        assert_eq!(in_progress.accepts(&IncomingEvent::snapshot_end(snap)), Ok(None));
    }

    #[test]
    fn test_predicate_matcher() {
        let m = WaitMatcher::predicate(|ev| ev.payload["id"] == json!(3));
        assert_eq!(
            m.accepts(&IncomingEvent::insert(json!({"id": 3}))),
            Ok(Some(MatchReason::Event))
        );
        assert_eq!(m.accepts(&IncomingEvent::insert(json!({"id": 4}))), Ok(None));
        assert_eq!(m.awaited_txid(), None);
    }

    #[test]
    fn test_fallible_predicate_error() {
        let p = Predicate::fallible(|ev: &IncomingEvent| {
            ev.payload
                .get("id")
                .map(|id| id == &json!(1))
                .ok_or("missing id")
        });
        assert_eq!(p.evaluate(&IncomingEvent::insert(json!({"id": 1}))), Ok(true));
        let err = p
            .evaluate(&IncomingEvent::insert(json!({})))
            .expect_err("missing id");
        assert_eq!(err.cause, PredicateFailure::Errored);
        assert_eq!(err.message, "missing id");
    }

    #[test]
    fn test_panicking_predicate_is_caught() {
        let p = Predicate::new(|_| panic!("bad predicate"));
        let err = p
            .evaluate(&IncomingEvent::up_to_date())
            .expect_err("panic caught");
        assert_eq!(err.cause, PredicateFailure::Panicked);
        assert_eq!(err.message, "bad predicate");
    }
}
