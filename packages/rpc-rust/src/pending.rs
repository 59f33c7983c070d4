//! Outstanding-call table: correlates responses with waiting `execute` calls.
//!
//! Flow:
//! 1. `execute` calls `register()` before appending its request
//! 2. The response listener calls `complete()` for every decoded response
//! 3. `execute` awaits the receiver under its deadline
//! 4. The `PendingGuard` removes the entry however the call ends
//!
//! Insert, lookup and removal go through the map's per-key locking, so a
//! completion either finds the entry and removes it atomically or finds
//! nothing. The sender moves out of the map before it fires, so a waiter
//! can never observe a half-updated entry.

use std::time::Instant;

use callite_core::{RequestId, Response};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

struct PendingCall {
    sender: oneshot::Sender<Response>,
    method: String,
    created_at: Instant,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry for `request_id` and returns its receiver.
    ///
    /// The guard removes the entry on drop unless a response already did.
    pub fn register(
        &self,
        request_id: RequestId,
        method: &str,
    ) -> (PendingGuard<'_>, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            request_id.clone(),
            PendingCall {
                sender: tx,
                method: method.to_string(),
                created_at: Instant::now(),
            },
        );
        (
            PendingGuard {
                calls: self,
                request_id,
            },
            rx,
        )
    }

    /// Hands `response` to the call waiting for it.
    ///
    /// Returns `false` if no call is waiting (timed out, cancelled, or never
    /// issued by this client); the response is then dropped.
    pub fn complete(&self, response: Response) -> bool {
        let Some((request_id, call)) = self.calls.remove(&response.request_id) else {
            debug!(request_id = %response.request_id, "dropping response with no pending call");
            return false;
        };
        let elapsed_ms = call.created_at.elapsed().as_millis();
        if call.sender.send(response).is_ok() {
            debug!(%request_id, method = %call.method, elapsed_ms, "completed pending call");
            true
        } else {
            debug!(%request_id, method = %call.method, "pending call receiver dropped");
            false
        }
    }

    /// Removes the entry for `request_id`. Returns whether one was present.
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.calls.remove(request_id).is_some()
    }

    #[must_use]
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.calls.contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drops every entry; their waiters observe a closed channel.
    pub fn clear(&self) {
        self.calls.clear();
    }
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls").field("len", &self.len()).finish()
    }
}

/// Removes its pending entry when dropped: on timeout, on error, and when
/// the `execute` future itself is dropped mid-await.
pub struct PendingGuard<'a> {
    calls: &'a PendingCalls,
    request_id: RequestId,
}

impl PendingGuard<'_> {
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.calls.cancel(&self.request_id) {
            debug!(request_id = %self.request_id, "removed abandoned pending call");
        }
    }
}
