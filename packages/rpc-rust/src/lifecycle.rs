//! Run/stop signalling with in-flight worker tracking.
//!
//! A `watch` channel carries the stop signal so every background loop can
//! select on it. RAII guards count spawned workers, and the last guard to
//! drop wakes anyone draining on close.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};

/// Shared running flag plus in-flight worker count.
///
/// 1. Loops check `is_running()` at each iteration boundary
/// 2. Loops select on `shutdown_receiver()` around every wait
/// 3. `trigger_shutdown()` flips the flag exactly once
/// 4. `wait_for_drain()` waits for in-flight workers to finish
#[derive(Debug)]
pub struct Lifecycle {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

impl Lifecycle {
    /// Creates a lifecycle in the running state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// `false` once shutdown has been triggered.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.shutdown_signal.borrow()
    }

    /// Returns a receiver that observes the shutdown signal.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Stops the lifecycle. Returns `true` only for the call that actually
    /// flipped it, so callers can make `close()` idempotent.
    pub fn trigger_shutdown(&self) -> bool {
        // send_replace stores the value even when no receiver is alive.
        !self.shutdown_signal.send_replace(true)
    }

    /// Resolves once shutdown has been triggered.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_receiver();
        // wait_for only errs if the sender is gone, which `self` prevents.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Creates an RAII guard that counts one in-flight worker.
    ///
    /// The counter is decremented when the guard drops, including during
    /// unwinding.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits for all in-flight workers to finish, up to `timeout`.
    ///
    /// Returns `false` if workers were still running when it expired.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.in_flight.drained.notified();
                tokio::pin!(notified);
                // Registered before the check so a guard dropping in between
                // still wakes us.
                notified.as_mut().enable();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}
