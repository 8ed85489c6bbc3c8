// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Confirmation values and the future a caller awaits.

use crate::abort::AbortBridge;
use crate::error::{ConfirmError, ConfirmResult};
use crate::event::{IncomingEvent, Txid};
use crate::registry::{TransactionWaitRegistry, WaitHandle};
use crate::snapshot::PgSnapshot;
use crate::timer::TimeoutController;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Evidence that a mutation reached the replication stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// A stream event matched the wait.
    Observed(Arc<IncomingEvent>),
    /// The txid had already been seen when the wait was registered.
    AlreadySeen(Txid),
    /// A snapshot makes the txid visible.
    VisibleInSnapshot { txid: Txid, snapshot: PgSnapshot },
}

impl Confirmation {
    /// The matching event, when confirmation came straight from the stream.
    pub fn event(&self) -> Option<&IncomingEvent> {
        match self {
            Self::Observed(event) => Some(event),
            _ => None,
        }
    }

    pub fn txid(&self) -> Option<Txid> {
        match self {
            Self::Observed(_) => None,
            Self::AlreadySeen(txid) | Self::VisibleInSnapshot { txid, .. } => Some(*txid),
        }
    }
}

/// Outcome delivered through a wait's completion channel.
pub type WaitOutcome = ConfirmResult<Confirmation>;

/// Deregisters a wait when its owner goes away before it settles.
struct WaitGuard {
    registry: Arc<TransactionWaitRegistry>,
    handle: WaitHandle,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.registry.remove(self.handle);
    }
}

enum State {
    Ready(Option<WaitOutcome>),
    Waiting {
        completion: oneshot::Receiver<WaitOutcome>,
        collection_id: Option<String>,
        // Field order is drop order: timer and listener go before the wait.
        _timer: Option<TimeoutController>,
        _abort: Option<AbortBridge>,
        _guard: WaitGuard,
    },
}

/// A registered confirmation request.
///
/// The wait is registered when this value is created, not when it is first
/// polled, so events dispatched in between are not missed. Dropping it
/// cancels the timer, unsubscribes from the abort signal and deregisters the
/// wait. Completing does the same.
///
/// # Panics
///
/// Panics if polled again after it returned [`Poll::Ready`].
#[must_use = "a pending confirmation does nothing unless awaited"]
pub struct PendingConfirmation {
    handle: Option<WaitHandle>,
    state: State,
}

impl PendingConfirmation {
    /// Already settled; nothing registered.
    pub(crate) fn ready(outcome: WaitOutcome) -> Self {
        Self {
            handle: None,
            state: State::Ready(Some(outcome)),
        }
    }

    pub(crate) fn waiting(
        registry: Arc<TransactionWaitRegistry>,
        handle: WaitHandle,
        completion: oneshot::Receiver<WaitOutcome>,
        timer: Option<TimeoutController>,
        abort: Option<AbortBridge>,
    ) -> Self {
        let collection_id = registry.collection_id().map(str::to_string);
        Self {
            handle: Some(handle),
            state: State::Waiting {
                completion,
                collection_id,
                _timer: timer,
                _abort: abort,
                _guard: WaitGuard { registry, handle },
            },
        }
    }

    /// Registry handle, if the request had to be registered at all.
    pub fn handle(&self) -> Option<WaitHandle> {
        self.handle
    }
}

impl Future for PendingConfirmation {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match &mut this.state {
            State::Ready(outcome) => outcome.take(),
            State::Waiting {
                completion,
                collection_id,
                ..
            } => match Pin::new(completion).poll(cx) {
                Poll::Ready(Ok(outcome)) => Some(outcome),
                // The registry went away with the wait still pending.
                Poll::Ready(Err(_)) => Some(Err(ConfirmError::Aborted {
                    collection_id: collection_id.clone(),
                })),
                Poll::Pending => return Poll::Pending,
            },
        };
        // Releases timer, listener and registry entry of a finished wait.
        this.state = State::Ready(None);
        match outcome {
            Some(outcome) => Poll::Ready(outcome),
            None => panic!("PendingConfirmation polled after completion"),
        }
    }
}

impl std::fmt::Debug for PendingConfirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.state {
            State::Ready(Some(_)) => "ready",
            State::Ready(None) => "done",
            State::Waiting { .. } => "waiting",
        };
        f.debug_struct("PendingConfirmation")
            .field("handle", &self.handle)
            .field("state", &state)
            .finish()
    }
}
