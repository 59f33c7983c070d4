//! Redis backend: streams + consumer groups for requests, pub/sub for replies.
//!
//! Commands share one multiplexed connection. Blocking `XREADGROUP` calls
//! get their own connection so a parked read never delays replies and acks
//! queued behind it.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::streams::{StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client, ErrorKind, Msg, RedisError};
use async_trait::async_trait;
use callite_core::PAYLOAD_FIELD;
use futures_util::{Stream, StreamExt};
use tracing::debug;

use super::{Broker, BrokerConnector, StreamMessage, Subscription};
use crate::error::BrokerError;

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            Self::Connection(err.to_string())
        } else if err.kind() == ErrorKind::InvalidClientConfig {
            Self::InvalidUrl(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

/// Broker handle backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    commands: MultiplexedConnection,
    reader: MultiplexedConnection,
}

impl RedisBroker {
    /// Opens the command and reader connections.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::InvalidUrl` for a malformed URL and
    /// `BrokerError::Connection` if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(|e| BrokerError::InvalidUrl(e.to_string()))?;
        let commands = client.get_multiplexed_async_connection().await?;
        let reader = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            commands,
            reader,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BrokerError> {
        let mut conn = self.commands.clone();
        let id: String = conn.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]).await?;
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<bool, BrokerError> {
        let mut conn = self.commands.clone();
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(true),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.reader.clone();
        #[allow(clippy::cast_possible_truncation)]
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1))
            .block(block.as_millis().max(1) as usize);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(|err| {
                if err.code() == Some("NOGROUP") {
                    BrokerError::NoGroup {
                        stream: stream.to_string(),
                        group: group.to_string(),
                    }
                } else {
                    err.into()
                }
            })?;

        // A timed-out block returns nil rather than an empty reply.
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| StreamMessage {
                payload: entry.get::<Vec<u8>>(PAYLOAD_FIELD),
                id: entry.id,
            })
            .collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.commands.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64, BrokerError> {
        let mut conn = self.commands.clone();
        let receivers: u64 = conn.publish(channel, payload).await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "subscribed");
        Ok(Box::new(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }
}

struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, BrokerError> {
        match tokio::time::timeout(wait, self.messages.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg.get_payload_bytes().to_vec())),
            Ok(None) => Err(BrokerError::SubscriptionClosed),
        }
    }
}

/// Connects a fresh `RedisBroker` per call.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    url: String,
}

impl RedisConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BrokerConnector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::new(RedisBroker::connect(&self.url).await?))
    }
}
