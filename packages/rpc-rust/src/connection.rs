//! Broker connection state shared by the client and server roles.
//!
//! Owns the current broker handle, the logical service name, the
//! instance's random connection identity, the naming namespace, and the
//! lifecycle flag every background loop watches.

use std::sync::Arc;

use callite_core::{ConnectionId, Namespace};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::broker::{Broker, BrokerConnector};
use crate::error::{BrokerError, RpcError};
use crate::lifecycle::Lifecycle;

pub struct BrokerConnection {
    service: String,
    connection_id: ConnectionId,
    namespace: Namespace,
    connector: Arc<dyn BrokerConnector>,
    broker: RwLock<Arc<dyn Broker>>,
    lifecycle: Lifecycle,
}

impl BrokerConnection {
    /// Establishes the initial broker handle.
    ///
    /// Recovery from later outages is the caller's job (`reconnect`); this
    /// only succeeds if the broker is reachable now.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` if the broker is unreachable.
    pub async fn connect(
        service: impl Into<String>,
        namespace: Namespace,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, RpcError> {
        let broker = connector.connect().await.map_err(RpcError::Connection)?;
        let connection = Self {
            service: service.into(),
            connection_id: ConnectionId::generate(),
            namespace,
            connector,
            broker: RwLock::new(broker),
            lifecycle: Lifecycle::new(),
        };
        debug!(
            service = %connection.service,
            connection_id = %connection.connection_id,
            "broker connection established"
        );
        Ok(connection)
    }

    /// The current broker handle. Cheap; callers should not hold it across
    /// a reconnect.
    #[must_use]
    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker.read())
    }

    /// Replaces the broker handle with a freshly connected one.
    ///
    /// The old handle stays in place if connecting fails.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the broker is still unreachable.
    pub async fn reconnect(&self) -> Result<(), BrokerError> {
        let fresh = self.connector.connect().await?;
        *self.broker.write() = fresh;
        info!(service = %self.service, connection_id = %self.connection_id, "reconnected to broker");
        Ok(())
    }

    /// Pings through the current handle.
    ///
    /// # Errors
    ///
    /// Returns the broker's error if the link is down.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        self.broker().ping().await
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Request stream of this connection's service.
    #[must_use]
    pub fn request_stream(&self) -> String {
        self.namespace.request_stream(&self.service)
    }

    /// Private response channel of this connection.
    #[must_use]
    pub fn response_channel(&self) -> String {
        self.namespace.response_channel(&self.connection_id)
    }

    #[must_use]
    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// Clears the running flag. Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        self.lifecycle.trigger_shutdown()
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("service", &self.service)
            .field("connection_id", &self.connection_id)
            .field("namespace", &self.namespace)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    async fn connect(broker: &MemoryBroker) -> Result<BrokerConnection, RpcError> {
        BrokerConnection::connect("svc", Namespace::default(), Arc::new(broker.clone())).await
    }

    #[tokio::test]
    async fn connect_derives_names() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.unwrap();
        assert_eq!(conn.service(), "svc");
        assert_eq!(conn.request_stream(), "/callite/request/svc");
        assert_eq!(
            conn.response_channel(),
            format!("/callite/response/{}", conn.connection_id())
        );
        assert!(conn.is_running());
    }

    #[tokio::test]
    async fn connect_fails_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        assert!(matches!(connect(&broker).await, Err(RpcError::Connection(_))));
    }

    #[tokio::test]
    async fn instances_get_distinct_identities() {
        let broker = MemoryBroker::new();
        let a = connect(&broker).await.unwrap();
        let b = connect(&broker).await.unwrap();
        assert_ne!(a.connection_id(), b.connection_id());
        assert_ne!(a.response_channel(), b.response_channel());
    }

    #[tokio::test]
    async fn reconnect_replaces_handle() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.unwrap();
        let before = conn.broker();
        conn.reconnect().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &conn.broker()));
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test]
    async fn failed_reconnect_keeps_old_handle() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.unwrap();
        let before = conn.broker();
        broker.set_available(false);
        assert!(conn.reconnect().await.is_err());
        assert!(Arc::ptr_eq(&before, &conn.broker()));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = MemoryBroker::new();
        let conn = connect(&broker).await.unwrap();
        assert!(conn.close());
        assert!(!conn.close());
        assert!(!conn.is_running());
    }
}
