//! Broker abstraction: append-only request streams read through competing
//! consumer groups, plus fan-out publish/subscribe channels for replies.
//!
//! Implementations: Redis (`redis`), in-process (`memory`).

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BrokerError, RpcError};

pub use self::memory::MemoryBroker;
pub use self::redis::{RedisBroker, RedisConnector};

/// One entry read from a request stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Broker-assigned entry id, used to acknowledge the entry.
    pub id: String,
    /// Contents of the payload field; `None` if the entry lacks it.
    pub payload: Option<Vec<u8>>,
}

/// Transport handle to a message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Round-trips to the broker to confirm the link is alive.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Appends `payload` to `stream`, creating the stream if needed.
    /// Returns the new entry's id.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BrokerError>;

    /// Creates consumer group `group` on `stream`, starting from the first
    /// entry and creating the stream if absent.
    ///
    /// Returns `Ok(false)` if the group already exists.
    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError>;

    /// Reads up to `count` never-delivered entries for `group`, waiting up
    /// to `block` if none are available. Each entry goes to exactly one
    /// consumer of the group.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// Marks entries as processed for `group`. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError>;

    /// Publishes `payload` on `channel`. Returns the number of subscribers
    /// it reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError>;

    /// Subscribes to `channel`. Messages published before this returns are
    /// not delivered.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// Live subscription to a single channel.
#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `wait` for the next message.
    ///
    /// Returns `Ok(None)` when the wait elapses with no traffic and
    /// `Err(BrokerError::SubscriptionClosed)` once the subscription is gone.
    async fn next_message(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError>;
}

/// Produces fresh broker handles; used for the initial connect and for
/// every reconnect.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}

/// Chooses a connector from the URL scheme.
///
/// # Errors
///
/// Returns `RpcError::Config` for an unsupported scheme.
pub fn connector_for_url(url: &str) -> Result<Arc<dyn BrokerConnector>, RpcError> {
    let scheme = url.split("://").next().unwrap_or_default();
    match scheme {
        "redis" | "rediss" | "redis+unix" | "unix" => Ok(Arc::new(RedisConnector::new(url))),
        _ => Err(RpcError::Config(format!("unsupported broker url: {url}"))),
    }
}
