// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timers behind an injectable clock.
//!
//! Production code runs on [`TokioClock`]. Tests inject a [`ManualClock`] and
//! move time forward explicitly, so deadline behaviour is asserted without
//! real sleeps.

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of time for deadlines.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Future completing once `duration` has elapsed on this clock.
    ///
    /// The deadline is fixed when `sleep` is called, not when the future is
    /// first polled.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Clock backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

struct ManualState {
    origin: Instant,
    elapsed: Duration,
    sleepers: Vec<(Duration, oneshot::Sender<()>)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                origin: Instant::now(),
                elapsed: Duration::ZERO,
                sleepers: Vec::new(),
            })),
        }
    }

    /// Move time forward, waking every sleeper whose deadline has passed.
    ///
    /// Woken tasks still have to be scheduled; yield to the runtime before
    /// asserting on their effects.
    pub fn advance(&self, by: Duration) {
        let due = {
            let mut state = self.inner.lock();
            state.elapsed += by;
            let now = state.elapsed;
            let (due, pending): (Vec<_>, Vec<_>) = state
                .sleepers
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            state.sleepers = pending;
            due
        };
        for (_, tx) in due {
            let _ = tx.send(());
        }
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }

    /// Sleepers not yet woken (dropped sleep futures included until the next
    /// `advance`).
    pub fn pending_sleepers(&self) -> usize {
        let mut state = self.inner.lock();
        state.sleepers.retain(|(_, tx)| !tx.is_closed());
        state.sleepers.len()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock();
        state.origin + state.elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            let deadline = state.elapsed + duration;
            if duration.is_zero() {
                let _ = tx.send(());
            } else {
                state.sleepers.push((deadline, tx));
            }
        }
        Box::pin(async move {
            // A dropped clock never fires.
            if rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        })
    }
}

type FireFn = Box<dyn FnOnce() + Send>;

/// Single-shot, cancellable timer.
///
/// `on_fire` runs at most once, and never after [`cancel`](Self::cancel) has
/// returned: firing and cancelling take the callback out of the same slot
/// under the same lock, and firing keeps the lock while the callback runs.
pub struct TimeoutController {
    slot: Arc<Mutex<Option<FireFn>>>,
    task: JoinHandle<()>,
}

impl TimeoutController {
    /// Arm a timer on `clock`. Must be called within a tokio runtime.
    pub fn start<C, F>(clock: &C, duration: Duration, on_fire: F) -> Self
    where
        C: Clock + ?Sized,
        F: FnOnce() + Send + 'static,
    {
        let slot: Arc<Mutex<Option<FireFn>>> = Arc::new(Mutex::new(Some(Box::new(on_fire))));
        let sleep = clock.sleep(duration);
        let fire_slot = Arc::clone(&slot);
        let task = tokio::spawn(async move {
            sleep.await;
            let mut slot = fire_slot.lock();
            if let Some(on_fire) = slot.take() {
                on_fire();
            }
        });
        Self { slot, task }
    }

    /// Disarm the timer. Idempotent.
    pub fn cancel(&self) {
        drop(self.slot.lock().take());
        self.task.abort();
    }

    /// Whether the timer can still fire.
    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl Drop for TimeoutController {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for TimeoutController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutController")
            .field("armed", &self.is_armed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_fires_once_after_deadline() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = TimeoutController::start(&clock, Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        clock.advance(Duration::from_millis(49));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timer.is_armed());

        clock.advance(Duration::from_millis(1));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());

        clock.advance(Duration::from_secs(10));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = TimeoutController::start(&clock, Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timer.cancel();
        timer.cancel();
        clock.advance(Duration::from_millis(10));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        drop(TimeoutController::start(
            &clock,
            Duration::from_millis(10),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ));
        clock.advance(Duration::from_millis(20));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_sleepers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let _timer = TimeoutController::start(&TokioClock, Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(49)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_clock_now_tracks_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - start, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }
}
