//! Calling side: appends requests to a service's request stream and waits
//! for replies on this client's private response channel.

use std::sync::Arc;
use std::time::Duration;

use callite_core::{decode_any, CallArgs, ConnectionId, Namespace, Request, Response, Value};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::{connector_for_url, BrokerConnector, Subscription};
use crate::config::RpcConfig;
use crate::connection::BrokerConnection;
use crate::error::RpcError;
use crate::pending::PendingCalls;
use crate::retry::Backoff;

/// RPC client bound to one target service.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and any
/// number of calls may be outstanding at once.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    connection: BrokerConnection,
    config: RpcConfig,
    pending: PendingCalls,
}

impl RpcClient {
    /// Connects to the broker named by `config.broker_url`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for invalid settings or an unsupported
    /// URL, and `RpcError::Connection` if the broker is unreachable.
    pub async fn connect(config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let connector = connector_for_url(&config.broker_url)?;
        Self::with_connector(config, connector).await
    }

    /// Connects through an explicit connector.
    ///
    /// The response subscription is live before this returns, so no reply
    /// to a later call can be published ahead of the listener.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::connect`].
    pub async fn with_connector(
        config: RpcConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let namespace = Namespace::new(config.queue_prefix.clone());
        let connection = BrokerConnection::connect(config.service.clone(), namespace, connector).await?;
        let subscription = connection
            .broker()
            .subscribe(&connection.response_channel())
            .await
            .map_err(RpcError::Connection)?;

        info!(
            service = %connection.service(),
            connection_id = %connection.connection_id(),
            "rpc client connected"
        );

        let inner = Arc::new(ClientInner {
            connection,
            config,
            pending: PendingCalls::new(),
        });
        let listener = tokio::spawn(Arc::clone(&inner).listen(subscription));

        Ok(Self {
            inner,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Calls `method` and waits up to the configured execution timeout.
    ///
    /// # Errors
    ///
    /// `RpcError::Remote` carries the handler's error message (or the
    /// not-registered notice); `RpcError::Timeout` if no reply arrived in
    /// time; `RpcError::Closed` after `close()`.
    pub async fn execute(&self, method: &str, args: CallArgs) -> Result<Value, RpcError> {
        self.execute_with_timeout(method, args, self.inner.config.execution_timeout)
            .await
    }

    /// Calls `method` and waits up to `timeout` for the reply.
    ///
    /// A reply that arrives after the deadline is discarded by the
    /// listener. The remote work is not cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::execute`].
    pub async fn execute_with_timeout(
        &self,
        method: &str,
        args: CallArgs,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let inner = &self.inner;
        if !inner.connection.is_running() {
            return Err(RpcError::Closed);
        }

        let request = Request::call(method, inner.connection.connection_id().clone(), args);
        let payload = inner.config.wire_format.encode(&request)?;

        // Registered before the append so a fast reply always finds its entry.
        let (_guard, rx) = inner.pending.register(request.request_id.clone(), method);
        debug!(method, request_id = %request.request_id, "executing");

        // `timeout` saturates oversized durations instead of overflowing.
        let outcome = tokio::time::timeout(timeout, async {
            inner.append_with_retry(&payload).await?;
            rx.await.map_err(|_| RpcError::Closed)
        })
        .await;

        match outcome {
            Err(_elapsed) => {
                warn!(method, request_id = %request.request_id, ?timeout, "call timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
            Ok(Err(err)) => Err(err),
            Ok(Ok(response)) => response.into_result().map_err(RpcError::Remote),
        }
    }

    /// Calls `method` and deserializes the result as `T`.
    ///
    /// # Errors
    ///
    /// Same as [`RpcClient::execute`], plus `RpcError::Result` if the
    /// value does not fit `T`.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, args: CallArgs) -> Result<T, RpcError> {
        let value = self.execute(method, args).await?;
        rmpv::ext::from_value(value).map_err(RpcError::Result)
    }

    /// Fire-and-forget: appends a request that asks for no reply.
    ///
    /// Returns once the request is on the stream. Meant for methods the
    /// server registered with `subscribe`.
    ///
    /// # Errors
    ///
    /// `RpcError::Timeout` if the broker stayed unreachable for the whole
    /// execution timeout; `RpcError::Closed` after `close()`.
    pub async fn publish(&self, method: &str, args: CallArgs) -> Result<(), RpcError> {
        let inner = &self.inner;
        if !inner.connection.is_running() {
            return Err(RpcError::Closed);
        }
        let request = Request::notification(method, inner.connection.connection_id().clone(), args);
        let payload = inner.config.wire_format.encode(&request)?;
        let timeout = inner.config.execution_timeout;

        tokio::time::timeout(timeout, inner.append_with_retry(&payload))
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                timeout,
            })??;
        debug!(method, request_id = %request.request_id, "published");
        Ok(())
    }

    /// Stops the response listener and fails every outstanding call with
    /// `RpcError::Closed`. Idempotent.
    pub async fn close(&self) {
        if self.inner.connection.close() {
            info!(connection_id = %self.inner.connection.connection_id(), "closing rpc client");
        }
        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            if let Err(err) = handle.await {
                warn!(error = %err, "response listener ended abnormally");
            }
        }
        self.inner.pending.clear();
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.connection.connection_id()
    }

    /// Target service name.
    #[must_use]
    pub fn service(&self) -> &str {
        self.inner.connection.service()
    }

    /// Calls currently waiting for a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.connection.is_running()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.inner.connection.close();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("connection", &self.inner.connection)
            .field("pending", &self.inner.pending)
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    /// Appends to the target stream, reconnecting with backoff while the
    /// broker is unreachable. The caller bounds the total time.
    async fn append_with_retry(&self, payload: &[u8]) -> Result<(), RpcError> {
        let stream = self.connection.request_stream();
        let mut backoff = Backoff::new(self.config.retry.clone());
        loop {
            if !self.connection.is_running() {
                return Err(RpcError::Closed);
            }
            match self.connection.broker().append(&stream, payload).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_connection() => {
                    let delay = backoff.next_delay();
                    warn!(
                        stream = %stream,
                        attempt = backoff.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(err) = self.connection.reconnect().await {
                        debug!(error = %err, "reconnect failed");
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Response listener: routes every decodable reply to its pending call
    /// until shutdown, resubscribing whenever the subscription is lost.
    async fn listen(self: Arc<Self>, mut subscription: Box<dyn Subscription>) {
        let mut shutdown = self.connection.lifecycle().shutdown_receiver();
        let channel = self.connection.response_channel();
        let mut backoff = Backoff::new(self.config.retry.clone());

        while self.connection.is_running() {
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = subscription.next_message(self.config.poll_interval) => next,
            };
            match next {
                Ok(Some(payload)) => self.deliver(&payload),
                Ok(None) => {}
                Err(err) => {
                    warn!(channel = %channel, error = %err, "response subscription lost");
                    match self.resubscribe(&channel, &mut backoff, &mut shutdown).await {
                        Some(fresh) => subscription = fresh,
                        None => break,
                    }
                }
            }
        }
        debug!(channel = %channel, "response listener stopped");
    }

    fn deliver(&self, payload: &[u8]) {
        match decode_any::<Response>(payload) {
            Ok((response, _format)) => {
                self.pending.complete(response);
            }
            Err(err) => debug!(error = %err, "dropping undecodable response"),
        }
    }

    /// Returns `None` if shutdown arrives first.
    async fn resubscribe(
        &self,
        channel: &str,
        backoff: &mut Backoff,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Box<dyn Subscription>> {
        loop {
            let delay = backoff.next_delay();
            tokio::select! {
                _ = shutdown.changed() => return None,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.connection.is_running() {
                return None;
            }
            match self.connection.broker().subscribe(channel).await {
                Ok(subscription) => {
                    info!(channel, attempts = backoff.attempts(), "response subscription restored");
                    backoff.reset();
                    return Some(subscription);
                }
                Err(err) => {
                    warn!(channel, attempt = backoff.attempts(), error = %err, "resubscribe failed");
                    if err.is_connection() {
                        if let Err(err) = self.connection.reconnect().await {
                            debug!(error = %err, "reconnect failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use callite_core::{args, WireFormat};
    use tokio::time::Instant;

    fn config() -> RpcConfig {
        let mut config = RpcConfig::new("memory://", "svc");
        config.poll_interval = Duration::from_millis(20);
        config.execution_timeout = Duration::from_millis(300);
        config.retry.initial_backoff = Duration::from_millis(5);
        config.retry.max_backoff = Duration::from_millis(20);
        config
    }

    async fn client(broker: &MemoryBroker) -> RpcClient {
        RpcClient::with_connector(config(), Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn connect_subscribes_before_returning() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let channel = format!("/callite/response/{}", client.connection_id());
        assert_eq!(broker.subscriber_count(&channel), 1);
        assert_eq!(client.service(), "svc");
    }

    #[tokio::test]
    async fn connect_rejects_unknown_scheme() {
        let err = RpcClient::connect(config()).await.unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }

    #[tokio::test]
    async fn connect_fails_when_broker_down() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let err = RpcClient::with_connector(config(), Arc::new(broker.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Connection(_)));
    }

    #[tokio::test]
    async fn execute_appends_request_and_times_out() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;

        let started = Instant::now();
        let err = client
            .execute_with_timeout("add", args![2, 3], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(broker.stream_len("/callite/request/svc"), 1);
    }

    #[tokio::test]
    async fn unbounded_timeout_waits_for_reply() {
        let broker = MemoryBroker::new();
        let client = Arc::new(client(&broker).await);
        broker.create_group("/callite/request/svc", "generic").await.unwrap();

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute_with_timeout("add", args![1, 2], Duration::MAX)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!caller.is_finished());
        assert_eq!(client.pending_count(), 1);

        let batch = broker
            .read_group("/callite/request/svc", "generic", "test", 1, Duration::from_secs(1))
            .await
            .unwrap();
        let (request, _): (Request, _) = decode_any(batch[0].payload.as_deref().unwrap()).unwrap();
        let reply = Response::ok("svc", request.request_id, Value::from(3));
        let channel = format!("/callite/response/{}", request.client_id);
        broker
            .publish(&channel, &WireFormat::MsgPack.encode(&reply).unwrap())
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), Value::from(3));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn reply_on_response_channel_completes_call() {
        let broker = MemoryBroker::new();
        let client = Arc::new(client(&broker).await);
        broker.create_group("/callite/request/svc", "generic").await.unwrap();

        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.execute("add", args![2, 3]).await })
        };

        let batch = broker
            .read_group("/callite/request/svc", "generic", "test", 1, Duration::from_secs(1))
            .await
            .unwrap();
        let payload = batch[0].payload.clone().unwrap();
        let (request, format): (Request, _) = decode_any(&payload).unwrap();
        assert_eq!(format, WireFormat::MsgPack);
        assert_eq!(request.method, "add");
        assert!(request.expects_reply);

        let reply = Response::ok("svc", request.request_id, Value::from(5));
        let channel = format!("/callite/response/{}", request.client_id);
        broker
            .publish(&channel, &WireFormat::Json.encode(&reply).unwrap())
            .await
            .unwrap();

        assert_eq!(caller.await.unwrap().unwrap(), Value::from(5));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn publish_marks_request_as_no_reply() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        broker.create_group("/callite/request/svc", "generic").await.unwrap();

        client.publish("log", args!["hello"]).await.unwrap();
        assert_eq!(client.pending_count(), 0);

        let batch = broker
            .read_group("/callite/request/svc", "generic", "test", 1, Duration::from_millis(50))
            .await
            .unwrap();
        let (request, _): (Request, _) = decode_any(batch[0].payload.as_deref().unwrap()).unwrap();
        assert!(!request.expects_reply);
        assert_eq!(request.args, vec![Value::from("hello")]);
    }

    #[tokio::test]
    async fn garbage_on_response_channel_is_ignored() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let channel = format!("/callite/response/{}", client.connection_id());
        broker.publish(&channel, b"\x00garbage").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_running());
    }

    #[tokio::test]
    async fn listener_resubscribes_after_loss() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let channel = format!("/callite/response/{}", client.connection_id());

        broker.drop_subscribers();
        assert_eq!(broker.subscriber_count(&channel), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.subscriber_count(&channel) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_calls() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        client.close().await;
        client.close().await;
        assert!(!client.is_running());
        assert!(matches!(
            client.execute("add", args![1, 2]).await,
            Err(RpcError::Closed)
        ));
        assert!(matches!(client.publish("log", args![]).await, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls() {
        let broker = MemoryBroker::new();
        let client = Arc::new(client(&broker).await);
        let caller = {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                client
                    .execute_with_timeout("slow", args![], Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        client.close().await;
        assert!(matches!(caller.await.unwrap(), Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn dropped_call_removes_pending_entry() {
        let broker = MemoryBroker::new();
        let client = client(&broker).await;
        let call = client.execute_with_timeout("slow", args![], Duration::from_secs(5));
        let _ = tokio::time::timeout(Duration::from_millis(30), call).await;
        assert_eq!(client.pending_count(), 0);
    }
}
