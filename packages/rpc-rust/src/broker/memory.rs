//! In-process broker with Redis-compatible stream and channel semantics.
//!
//! Streams keep every appended entry; each consumer group has a cursor
//! (next undelivered entry) and a pending list (delivered, not yet acked).
//! Channels fan out to whoever is subscribed at publish time. Clones share
//! state, so one `MemoryBroker` can back any number of clients and servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{Broker, BrokerConnector, StreamMessage, Subscription};
use crate::error::BrokerError;

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<(String, Vec<u8>)>,
    groups: HashMap<String, GroupCursor>,
}

#[derive(Debug, Default)]
struct GroupCursor {
    /// Index of the next never-delivered entry.
    next: usize,
    /// Delivered but unacknowledged entry ids, with the consumer holding them.
    pending: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    unavailable: AtomicBool,
    failing_acks: AtomicBool,
    connects: AtomicU64,
    next_id: AtomicU64,
}

/// Shared in-process broker. Also acts as its own `BrokerConnector`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<MemoryState>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the broker going down (`false`) or coming back (`true`).
    /// While down, every operation and every connect attempt fails.
    pub fn set_available(&self, available: bool) {
        self.state.unavailable.store(!available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.state.unavailable.load(Ordering::SeqCst)
    }

    /// Makes `ack` reject every call while `true`; other commands are unaffected.
    pub fn fail_acks(&self, failing: bool) {
        self.state.failing_acks.store(failing, Ordering::SeqCst);
    }

    /// Closes every live subscription, as if the link carrying them dropped.
    pub fn drop_subscribers(&self) {
        self.state.channels.lock().clear();
    }

    /// Number of successful and failed `connect()` calls so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Entries ever appended to `stream`.
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .streams
            .lock()
            .get(stream)
            .map_or(0, |log| log.entries.len())
    }

    /// Delivered-but-unacknowledged entries for `group` on `stream`.
    #[must_use]
    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.state
            .streams
            .lock()
            .get(stream)
            .and_then(|log| log.groups.get(group))
            .map_or(0, |cursor| cursor.pending.len())
    }

    /// Live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .channels
            .lock()
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BrokerError::Connection("memory broker unavailable".to_string()))
        }
    }

    /// Takes up to `count` undelivered entries, or `None` if there are none.
    fn take_undelivered(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Option<Vec<StreamMessage>>, BrokerError> {
        let no_group = || BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let mut streams = self.state.streams.lock();
        let StreamLog { entries, groups } = streams.get_mut(stream).ok_or_else(no_group)?;
        let cursor = groups.get_mut(group).ok_or_else(no_group)?;

        if cursor.next >= entries.len() {
            return Ok(None);
        }
        let end = entries.len().min(cursor.next + count.max(1));
        let batch: Vec<StreamMessage> = entries[cursor.next..end]
            .iter()
            .map(|(id, payload)| {
                cursor.pending.insert(id.clone(), consumer.to_string());
                StreamMessage {
                    id: id.clone(),
                    payload: Some(payload.clone()),
                }
            })
            .collect();
        cursor.next = end;
        Ok(Some(batch))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        self.check_available()
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BrokerError> {
        self.check_available()?;
        let seq = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{seq}-0");
        self.state
            .streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .entries
            .push((id.clone(), payload.to_vec()));
        self.state.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError> {
        self.check_available()?;
        let mut streams = self.state.streams.lock();
        let log = streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Ok(false);
        }
        log.groups.insert(group.to_string(), GroupCursor::default());
        Ok(true)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let deadline = Instant::now() + block;
        loop {
            // Register interest before checking so an append between the
            // check and the wait still wakes us.
            let notified = self.state.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            if let Some(batch) = self.take_undelivered(stream, group, consumer, count)? {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        self.check_available()?;
        if self.state.failing_acks.load(Ordering::SeqCst) {
            return Err(BrokerError::Command("ack rejected".to_string()));
        }
        let mut streams = self.state.streams.lock();
        let Some(cursor) = streams.get_mut(stream).and_then(|log| log.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids.iter().filter(|id| cursor.pending.remove(*id).is_some()).count();
        Ok(acked as u64)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError> {
        self.check_available()?;
        let mut channels = self.state.channels.lock();
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(payload.to_vec()).is_ok());
        Ok(subscribers.len() as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::new(MemorySubscription { rx }))
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(Arc::new(self.clone()))
    }
}

struct MemorySubscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(payload)) => Ok(Some(payload)),
            Ok(None) => Err(BrokerError::SubscriptionClosed),
        }
    }
}
