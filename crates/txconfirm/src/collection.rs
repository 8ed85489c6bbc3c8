// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! A synced collection and its confirmation API.
//!
//! [`ShapeCollection`] owns one [`TransactionWaitRegistry`] and the recent
//! stream history needed to confirm writes whose response arrives after the
//! matching event: seen txids, snapshots and the recent change batches.
//!
//! The replication layer calls [`ShapeCollection::notify_incoming_event`]
//! once per stream entry, in order. History is updated before waits are
//! scanned and waits are registered before history is checked, so an event
//! racing with a new wait is observed by at least one of the two paths.

use crate::abort::{AbortBridge, AbortSignal};
use crate::config::{CollectionConfig, ConfigError};
use crate::confirmation::{Confirmation, PendingConfirmation};
use crate::error::ConfirmError;
use crate::event::{parse_txid, EventKind, IncomingEvent, Txid};
use crate::matcher::{Predicate, WaitMatcher};
use crate::registry::{
    ConfirmOn, DispatchReport, PredicateDiagnostic, TransactionWaitRegistry, WaitHandle,
};
use crate::snapshot::PgSnapshot;
use crate::stats::{ConfirmationStats, ConfirmationStatsSnapshot};
use crate::timer::{Clock, TimeoutController, TokioClock};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Deadline of a single await call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    /// Use the collection's configured timeout for this kind of wait.
    #[default]
    CollectionDefault,
    /// Give up after this long.
    After(Duration),
    /// Wait until confirmed, aborted or the stream closes.
    Indefinite,
}

/// Per-call options for `await_txid` / `await_match`.
#[derive(Debug, Clone, Default)]
pub struct AwaitOptions {
    pub deadline: Deadline,
    pub signal: Option<AbortSignal>,
}

impl AwaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.deadline = Deadline::After(duration);
        self
    }

    #[must_use]
    pub fn indefinite(mut self) -> Self {
        self.deadline = Deadline::Indefinite;
        self
    }

    #[must_use]
    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Stream history kept for late callers.
struct History {
    seen_txids: LruCache<Txid, ()>,
    // Txids and snapshots of the open batch, in `ConfirmOn::UpToDate` mode.
    // Both survive must-refetch: waits already marked on them still resolve
    // at the next boundary.
    staged_txids: Vec<Txid>,
    staged_snapshots: Vec<PgSnapshot>,
    snapshots: VecDeque<PgSnapshot>,
    snapshot_capacity: usize,
    current_batch: VecDeque<Arc<IncomingEvent>>,
    last_batch: Vec<Arc<IncomingEvent>>,
    max_batch_events: usize,
}

impl History {
    fn new(config: &CollectionConfig) -> Result<Self, ConfigError> {
        let capacity = NonZeroUsize::new(config.seen_txid_capacity).ok_or_else(|| {
            ConfigError::Invalid("seen_txid_capacity must be at least 1".into())
        })?;
        Ok(Self {
            seen_txids: LruCache::new(capacity),
            staged_txids: Vec::new(),
            staged_snapshots: Vec::new(),
            snapshots: VecDeque::new(),
            snapshot_capacity: config.seen_snapshot_capacity,
            current_batch: VecDeque::new(),
            last_batch: Vec::new(),
            max_batch_events: config.max_batch_events,
        })
    }

    fn record(&mut self, event: &Arc<IncomingEvent>, confirm_on: ConfirmOn) {
        match &event.kind {
            EventKind::Change { .. } => {
                match confirm_on {
                    ConfirmOn::Match => {
                        for txid in &event.txids {
                            self.seen_txids.put(*txid, ());
                        }
                    }
                    ConfirmOn::UpToDate => self.staged_txids.extend_from_slice(&event.txids),
                }
                if self.max_batch_events > 0 {
                    if self.current_batch.len() == self.max_batch_events {
                        self.current_batch.pop_front();
                    }
                    self.current_batch.push_back(Arc::clone(event));
                }
            }
            EventKind::SnapshotEnd { snapshot } => match confirm_on {
                ConfirmOn::Match => self.commit_snapshot(snapshot.clone()),
                ConfirmOn::UpToDate => self.staged_snapshots.push(snapshot.clone()),
            },
            EventKind::UpToDate => {
                for txid in std::mem::take(&mut self.staged_txids) {
                    self.seen_txids.put(txid, ());
                }
                for snapshot in std::mem::take(&mut self.staged_snapshots) {
                    self.commit_snapshot(snapshot);
                }
                self.last_batch = self.current_batch.drain(..).collect();
            }
            EventKind::MustRefetch => {
                self.current_batch.clear();
                self.last_batch.clear();
            }
        }
    }

    fn commit_snapshot(&mut self, snapshot: PgSnapshot) {
        if self.snapshots.len() == self.snapshot_capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot);
    }

    fn lookup_txid(&mut self, txid: Txid) -> Option<Lookup> {
        if self.seen_txids.get(&txid).is_some() {
            return Some(Lookup::Committed(Confirmation::AlreadySeen(txid)));
        }
        if let Some(snapshot) = self.snapshots.iter().rev().find(|s| s.is_visible(txid)) {
            return Some(Lookup::Committed(Confirmation::VisibleInSnapshot {
                txid,
                snapshot: snapshot.clone(),
            }));
        }
        if self.staged_txids.contains(&txid) {
            return Some(Lookup::Staged(Confirmation::AlreadySeen(txid)));
        }
        self.staged_snapshots
            .iter()
            .rev()
            .find(|s| s.is_visible(txid))
            .map(|snapshot| {
                Lookup::Staged(Confirmation::VisibleInSnapshot {
                    txid,
                    snapshot: snapshot.clone(),
                })
            })
    }
}

/// Result of checking history for a new wait.
enum Lookup {
    /// Confirmed by a completed batch or a snapshot.
    Committed(Confirmation),
    /// Matched by the open batch; confirmed at its up-to-date boundary.
    Staged(Confirmation),
}

struct Inner {
    config: CollectionConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<TransactionWaitRegistry>,
    stats: Arc<ConfirmationStats>,
    history: Mutex<History>,
    ready: watch::Sender<bool>,
    closed: AtomicBool,
    stream: Mutex<Option<AbortBridge>>,
}

impl Inner {
    fn label(&self) -> &str {
        self.config.id.as_deref().unwrap_or("-")
    }

    fn aborted_error(&self) -> ConfirmError {
        ConfirmError::Aborted {
            collection_id: self.config.id.clone(),
        }
    }

    fn mark_ready(&self) {
        let changed = self.ready.send_if_modified(|ready| {
            let was_ready = *ready;
            *ready = true;
            !was_ready
        });
        if changed {
            tracing::info!(collection = self.label(), "collection ready");
        }
    }

    fn abort_stream(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let id = self.config.id.clone();
        let rejected = self.registry.reject_all(|_| ConfirmError::Aborted {
            collection_id: id.clone(),
        });
        // Taken out first: releasing locks the signal.
        let bridge = self.stream.lock().take();
        drop(bridge);
        tracing::info!(
            collection = self.label(),
            rejected,
            "stream aborted, pending waits rejected"
        );
        self.mark_ready();
        rejected
    }
}

/// Builder for [`ShapeCollection`].
pub struct ShapeCollectionBuilder {
    config: CollectionConfig,
    clock: Arc<dyn Clock>,
    stream_signal: Option<AbortSignal>,
}

impl ShapeCollectionBuilder {
    /// Use a custom clock for deadlines.
    #[must_use]
    pub fn clock<C: Clock>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Close the collection when `signal` fires.
    #[must_use]
    pub fn stream_signal(mut self, signal: AbortSignal) -> Self {
        self.stream_signal = Some(signal);
        self
    }

    pub fn build(self) -> Result<ShapeCollection, ConfigError> {
        self.config.validate()?;
        let stats = Arc::new(ConfirmationStats::new());
        let registry = Arc::new(TransactionWaitRegistry::new(
            self.config.id.clone(),
            self.config.confirm_on,
            self.config.diagnostics_capacity,
            Arc::clone(&stats),
        ));
        let history = History::new(&self.config)?;
        let (ready, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config: self.config,
            clock: self.clock,
            registry,
            stats,
            history: Mutex::new(history),
            ready,
            closed: AtomicBool::new(false),
            stream: Mutex::new(None),
        });

        if let Some(signal) = self.stream_signal {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            let bridge = AbortBridge::bind(&signal, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.abort_stream();
                }
            });
            if !inner.closed.load(Ordering::Acquire) {
                *inner.stream.lock() = Some(bridge);
            }
        }

        tracing::debug!(collection = inner.label(), "collection created");
        Ok(ShapeCollection { inner })
    }
}

/// One synced collection: confirmation API plus the stream inbound boundary.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ShapeCollection {
    inner: Arc<Inner>,
}

impl ShapeCollection {
    /// Build with the tokio clock and no stream signal.
    pub fn new(config: CollectionConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: CollectionConfig) -> ShapeCollectionBuilder {
        ShapeCollectionBuilder {
            config,
            clock: Arc::new(TokioClock),
            stream_signal: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.inner.config.id.as_deref()
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.inner.config
    }

    /// Wait until `txid` is observed on the stream.
    ///
    /// The wait is registered before this returns. Must be called within a
    /// tokio runtime when a deadline applies.
    pub fn await_txid(&self, txid: Txid, options: AwaitOptions) -> PendingConfirmation {
        let inner = &self.inner;
        let timeout = match options.deadline {
            Deadline::CollectionDefault => inner.config.txid_timeout(),
            Deadline::After(duration) => Some(duration),
            Deadline::Indefinite => None,
        };
        let on_timeout = ConfirmError::TimeoutTxId {
            txid,
            collection_id: inner.config.id.clone(),
        };
        self.register(
            WaitMatcher::txid(txid),
            timeout,
            on_timeout,
            options.signal,
            |inner, _| inner.history.lock().lookup_txid(txid),
        )
    }

    /// Like [`await_txid`](Self::await_txid) for a txid of unknown type,
    /// e.g. taken straight from a JSON mutation response.
    ///
    /// Anything but a non-negative integer fails immediately with
    /// [`ConfirmError::InvalidTxIdType`]; nothing is registered.
    pub fn await_txid_value(&self, txid: &Value, options: AwaitOptions) -> PendingConfirmation {
        match parse_txid(txid, self.id()) {
            Ok(txid) => self.await_txid(txid, options),
            Err(e) => {
                self.record_rejected_txid(&e);
                PendingConfirmation::ready(Err(e))
            }
        }
    }

    pub(crate) fn record_rejected_txid(&self, error: &ConfirmError) {
        tracing::debug!(collection = self.inner.label(), error = %error, "rejected txid");
        ConfirmationStats::bump(self.inner.stats.rejection_counter(error));
    }

    /// Wait until an event satisfies `predicate`.
    pub fn await_match<F>(&self, predicate: F, options: AwaitOptions) -> PendingConfirmation
    where
        F: Fn(&IncomingEvent) -> bool + Send + Sync + 'static,
    {
        self.await_match_with(Predicate::new(predicate), options)
    }

    /// Wait until an event satisfies `predicate`.
    ///
    /// Events of the open and the last completed batch are checked first.
    pub fn await_match_with(&self, predicate: Predicate, options: AwaitOptions) -> PendingConfirmation {
        let inner = &self.inner;
        let timeout = match options.deadline {
            Deadline::CollectionDefault => inner.config.match_timeout(),
            Deadline::After(duration) => Some(duration),
            Deadline::Indefinite => None,
        };
        let on_timeout = ConfirmError::TimeoutMatch {
            collection_id: inner.config.id.clone(),
        };
        let buffered = predicate.clone();
        self.register(
            WaitMatcher::ByPredicate(predicate),
            timeout,
            on_timeout,
            options.signal,
            move |inner, handle| {
                // Predicates run without the history lock held.
                let (committed, open) = {
                    let history = inner.history.lock();
                    let open: Vec<_> = history.current_batch.iter().cloned().collect();
                    (history.last_batch.clone(), open)
                };
                scan_batches(&inner.registry, handle, &buffered, committed, open)
            },
        )
    }

    fn register<L>(
        &self,
        matcher: WaitMatcher,
        timeout: Option<Duration>,
        on_timeout: ConfirmError,
        signal: Option<AbortSignal>,
        lookup: L,
    ) -> PendingConfirmation
    where
        L: FnOnce(&Inner, WaitHandle) -> Option<Lookup>,
    {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return PendingConfirmation::ready(Err(inner.aborted_error()));
        }

        let registry = Arc::clone(&inner.registry);
        let (handle, completion) = registry.register(matcher);

        if inner.closed.load(Ordering::Acquire) {
            registry.cancel(handle, inner.aborted_error());
            return PendingConfirmation::waiting(registry, handle, completion, None, None);
        }

        match lookup(inner, handle) {
            Some(Lookup::Committed(confirmation)) => {
                tracing::debug!(collection = inner.label(), %handle, "confirmed from history");
                registry.resolve(handle, confirmation);
                return PendingConfirmation::waiting(registry, handle, completion, None, None);
            }
            Some(Lookup::Staged(confirmation)) => {
                tracing::debug!(collection = inner.label(), %handle, "matched open batch");
                registry.mark(handle, confirmation);
            }
            None => {}
        }

        let abort = signal.map(|signal| {
            let registry = Arc::clone(&registry);
            let reason = inner.aborted_error();
            AbortBridge::bind(&signal, move || {
                registry.cancel(handle, reason);
            })
        });

        // An already-fired signal has settled the wait; no timer needed.
        let timer = timeout.filter(|_| registry.contains(handle)).map(|duration| {
            let registry = Arc::clone(&registry);
            TimeoutController::start(&*inner.clock, duration, move || {
                registry.cancel(handle, on_timeout);
            })
        });

        PendingConfirmation::waiting(registry, handle, completion, timer, abort)
    }

    /// Inbound boundary: one replication stream entry.
    ///
    /// Events addressed to another collection are ignored, as is everything
    /// after the stream was aborted.
    pub fn notify_incoming_event(&self, event: IncomingEvent) -> DispatchReport {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            tracing::debug!(collection = inner.label(), "event after stream abort ignored");
            ConfirmationStats::bump(&inner.stats.events_ignored);
            return DispatchReport::default();
        }
        if let (Some(target), Some(own)) = (&event.collection_id, &inner.config.id) {
            if target != own {
                tracing::debug!(
                    collection = inner.label(),
                    target = %target,
                    "event for another collection ignored"
                );
                ConfirmationStats::bump(&inner.stats.events_ignored);
                return DispatchReport::default();
            }
        }

        let event = Arc::new(event);
        inner
            .history
            .lock()
            .record(&event, inner.config.confirm_on);
        let report = inner.registry.notify(&event);
        if event.is_up_to_date() {
            inner.mark_ready();
        }
        report
    }

    /// Completes once the initial snapshot has been applied, or the
    /// collection was marked ready or closed.
    pub async fn preload(&self) {
        let mut rx = self.inner.ready.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Mark the collection ready without waiting for up-to-date.
    pub fn mark_ready(&self) {
        self.inner.mark_ready();
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    /// Close the collection, rejecting every pending wait with
    /// [`ConfirmError::Aborted`]. Returns the number of waits rejected;
    /// later calls do nothing.
    pub fn abort_stream(&self) -> usize {
        self.inner.abort_stream()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Waits currently registered.
    pub fn pending_waits(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn stats(&self) -> ConfirmationStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Subscribe to custom match function failures.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<PredicateDiagnostic> {
        self.inner.registry.subscribe_diagnostics()
    }
}

impl fmt::Debug for ShapeCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShapeCollection")
            .field("id", &self.inner.config.id)
            .field("pending", &self.inner.registry.len())
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn scan_batches(
    registry: &TransactionWaitRegistry,
    handle: WaitHandle,
    predicate: &Predicate,
    committed: Vec<Arc<IncomingEvent>>,
    open: Vec<Arc<IncomingEvent>>,
) -> Option<Lookup> {
    let first_match = |events: Vec<Arc<IncomingEvent>>| {
        events.into_iter().find(|event| match predicate.evaluate(event) {
            Ok(matched) => matched,
            Err(error) => {
                registry.report_predicate_failure(handle, error);
                false
            }
        })
    };
    if let Some(event) = first_match(committed) {
        return Some(Lookup::Committed(Confirmation::Observed(event)));
    }
    first_match(open).map(|event| {
        let confirmation = Confirmation::Observed(event);
        match registry.confirm_on() {
            ConfirmOn::Match => Lookup::Committed(confirmation),
            ConfirmOn::UpToDate => Lookup::Staged(confirmation),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;
    use crate::timer::ManualClock;
    use serde_json::json;

    fn collection() -> ShapeCollection {
        ShapeCollection::builder(CollectionConfig::named("todos"))
            .clock(ManualClock::new())
            .build()
            .expect("build")
    }

    #[tokio::test]
    async fn test_txid_confirmed_by_event() {
        let c = collection();
        let pending = c.await_txid(7, AwaitOptions::new());
        assert_eq!(c.pending_waits(), 1);

        let report = c.notify_incoming_event(IncomingEvent::insert(json!({"id": 1})).with_txid(7));
        assert_eq!(report.resolved, 1);
        let confirmation = pending.await.expect("confirmed");
        assert!(confirmation.event().is_some_and(|e| e.carries_txid(7)));
        assert_eq!(c.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_seen_txid_resolves_immediately() {
        let c = collection();
        c.notify_incoming_event(IncomingEvent::insert(json!({})).with_txid(3));
        let confirmation = c.await_txid(3, AwaitOptions::new()).await.expect("seen");
        assert_eq!(confirmation, Confirmation::AlreadySeen(3));
        assert_eq!(c.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_invalid_txid_value() {
        let c = collection();
        let err = c
            .await_txid_value(&json!("42"), AwaitOptions::new())
            .await
            .expect_err("string txid");
        assert_eq!(err.name(), "ExpectedNumberInAwaitTxIdError");
        assert_eq!(err.to_string(), "[todos] Expected number in awaitTxId, received string");
        assert_eq!(c.stats().registered, 0);
    }

    #[tokio::test]
    async fn test_misrouted_event_ignored() {
        let c = collection();
        let pending = c.await_txid(5, AwaitOptions::new().indefinite());
        let report = c.notify_incoming_event(
            IncomingEvent::insert(json!({})).with_txid(5).for_collection("users"),
        );
        assert_eq!(report, DispatchReport::default());
        assert_eq!(c.pending_waits(), 1);
        assert_eq!(c.stats().events_ignored, 1);
        drop(pending);
        assert_eq!(c.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_stream_signal_closes_collection() {
        let controller = AbortController::new();
        let c = ShapeCollection::builder(CollectionConfig::named("todos"))
            .clock(ManualClock::new())
            .stream_signal(controller.signal())
            .build()
            .expect("build");
        let pending = c.await_txid(1, AwaitOptions::new());

        controller.abort();
        assert!(c.is_closed());
        assert!(c.is_ready());
        let err = pending.await.expect_err("aborted");
        assert_eq!(err.name(), "StreamAbortedError");

        let late = c.await_txid(2, AwaitOptions::new()).await;
        assert!(late.expect_err("closed").is_aborted());
    }

    #[tokio::test]
    async fn test_preload_waits_for_up_to_date() {
        let c = collection();
        assert!(!c.is_ready());
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.preload().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        c.notify_incoming_event(IncomingEvent::up_to_date());
        waiter.await.expect("join");
        assert!(c.is_ready());
    }
}
