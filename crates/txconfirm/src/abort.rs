// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Caller-driven cancellation.
//!
//! An [`AbortController`] owns the right to abort; any number of
//! [`AbortSignal`] clones observe it. Listeners run synchronously inside
//! [`AbortController::abort`], each at most once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

type Listener = Box<dyn FnOnce() + Send>;

struct SignalState {
    aborted: bool,
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

struct SignalInner {
    state: Mutex<SignalState>,
    watch: watch::Sender<bool>,
}

/// Read side of an abort controller.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

/// Identifies a listener registered with [`AbortSignal::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl AbortSignal {
    fn new() -> Self {
        let (watch, _) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner {
                state: Mutex::new(SignalState {
                    aborted: false,
                    next_id: 0,
                    listeners: HashMap::new(),
                }),
                watch,
            }),
        }
    }

    /// A signal that has already fired.
    pub fn aborted_signal() -> Self {
        let controller = AbortController::new();
        controller.abort();
        controller.signal()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.state.lock().aborted
    }

    /// Run `listener` when the signal fires.
    ///
    /// If the signal already fired, `listener` runs immediately on the
    /// calling thread and `None` is returned.
    pub fn add_listener<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if state.aborted {
            drop(state);
            listener();
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, Box::new(listener));
        Some(ListenerId(id))
    }

    /// Remove a listener. Returns `false` if it already ran or was removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.state.lock().listeners.remove(&id.0).is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Completes once the signal has fired.
    pub async fn aborted(&self) {
        let mut rx = self.inner.watch.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// Write side: fires the signal.
#[derive(Debug, Clone)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Fire the signal. Only the first call runs listeners.
    pub fn abort(&self) {
        let listeners = {
            let mut state = self.signal.inner.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            std::mem::take(&mut state.listeners)
        };
        self.signal.inner.watch.send_replace(true);

        // Listeners run without the lock so they may touch the signal.
        let mut listeners: Vec<_> = listeners.into_iter().collect();
        listeners.sort_by_key(|(id, _)| *id);
        for (_, listener) in listeners {
            listener();
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds a terminal callback to an [`AbortSignal`] for the lifetime of the
/// bridge.
///
/// Dropping the bridge removes the listener, so a bridge that outlives its
/// purpose never fires.
pub struct AbortBridge {
    signal: AbortSignal,
    listener: Option<ListenerId>,
}

impl AbortBridge {
    /// Subscribe `on_abort`. Runs it immediately if `signal` already fired.
    pub fn bind<F>(signal: &AbortSignal, on_abort: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let listener = signal.add_listener(on_abort);
        Self {
            signal: signal.clone(),
            listener,
        }
    }

    /// Remove the listener. Idempotent.
    pub fn release(&mut self) {
        if let Some(id) = self.listener.take() {
            self.signal.remove_listener(id);
        }
    }
}

impl Drop for AbortBridge {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for AbortBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortBridge")
            .field("bound", &self.listener.is_some())
            .finish()
    }
}
