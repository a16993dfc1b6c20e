//! Restartable, cancellable timer used for debounced saves and the typing indicator.
//!
//! `schedule` replaces a timer that has not fired yet. Work whose delay already
//! elapsed keeps running; only `cancel` (or drop) aborts it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

struct Timer {
    handle: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct Debouncer {
    pending: Mutex<Option<Timer>>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any timer that has not fired yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = Arc::clone(&fired);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fired_clone.store(true, Ordering::Release);
            task.await;
        });

        let previous = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Timer { handle, fired });

        if let Some(previous) = previous {
            if previous.fired.load(Ordering::Acquire) {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(previous.handle);
            } else {
                previous.handle.abort();
            }
        }
    }

    /// Whether a scheduled timer is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.fired.load(Ordering::Acquire) && !t.handle.is_finished())
    }

    /// Abort the waiting timer only; work that already started keeps running.
    ///
    /// Returns true if a timer was still waiting to fire.
    pub fn cancel_pending(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(timer) if timer.fired.load(Ordering::Acquire) => {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.retain(|h| !h.is_finished());
                in_flight.push(timer.handle);
                false
            }
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort the waiting timer and any work it already started.
    ///
    /// Returns true if a timer was still waiting to fire.
    pub fn cancel(&self) -> bool {
        let was_pending = self.is_pending();
        if let Some(timer) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() {
            timer.handle.abort();
        }
        for handle in self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        was_pending
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
