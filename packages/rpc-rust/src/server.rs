//! Serving side: reads the service's request stream through a consumer
//! group and runs each request on its own worker task.
//!
//! The dispatch loop is a small state machine:
//!
//! ```text
//! Disconnected -> Subscribing -> Polling -> Dispatching -> Polling ...
//!      ^                                         |
//!      +------------- any broker error ----------+
//! ```
//!
//! Every cycle pings the broker first (reconnecting on failure), makes sure
//! the consumer group exists after any reconnect, reads at most one entry,
//! acknowledges it, and hands it to a worker. Acknowledging before the
//! worker runs gives at-most-once execution: a worker that fails never sees
//! its request again.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use callite_core::{decode_any, CallArgs, ConnectionId, Namespace, Request, Response, Value, WireFormat};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::broker::{connector_for_url, BrokerConnector};
use crate::config::RpcConfig;
use crate::connection::BrokerConnection;
use crate::error::{BrokerError, RpcError};
use crate::registry::{FnHandler, Handler, MethodRegistry};
use crate::retry::Backoff;

// ---------------------------------------------------------------------------
// DispatchState
// ---------------------------------------------------------------------------

/// Where the dispatch loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// No verified broker link; the next cycle pings and reconnects.
    Disconnected,
    /// Creating the consumer group on the request stream.
    Subscribing,
    /// Waiting for the next request.
    Polling,
    /// Handing a received request to a worker.
    Dispatching,
}

// ---------------------------------------------------------------------------
// RpcServer
// ---------------------------------------------------------------------------

/// RPC server for one logical service.
///
/// The dispatch task starts at construction. Register methods right after
/// connecting; a request for a name not yet registered gets the
/// not-registered reply.
pub struct RpcServer {
    inner: Arc<ServerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

struct ServerInner {
    connection: BrokerConnection,
    config: RpcConfig,
    registry: MethodRegistry,
    state: ArcSwap<DispatchState>,
    /// Bounds concurrent workers when `max_concurrent_workers` is set.
    workers: Option<Arc<Semaphore>>,
}

impl RpcServer {
    /// Connects to the broker named by `config.broker_url` and starts
    /// dispatching.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for invalid settings or an unsupported
    /// URL, and `RpcError::Connection` if the broker is unreachable now.
    /// Later outages are handled by reconnecting.
    pub async fn connect(config: RpcConfig) -> Result<Self, RpcError> {
        config.validate()?;
        let connector = connector_for_url(&config.broker_url)?;
        Self::with_connector(config, connector).await
    }

    /// Connects through an explicit connector and starts dispatching.
    ///
    /// # Errors
    ///
    /// Same as [`RpcServer::connect`].
    pub async fn with_connector(
        config: RpcConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let namespace = Namespace::new(config.queue_prefix.clone());
        let connection = BrokerConnection::connect(config.service.clone(), namespace, connector).await?;

        info!(
            service = %connection.service(),
            connection_id = %connection.connection_id(),
            stream = %connection.request_stream(),
            group = %config.group_name,
            "rpc server connected"
        );

        let inner = Arc::new(ServerInner {
            workers: config.max_concurrent_workers.map(|n| Arc::new(Semaphore::new(n))),
            connection,
            config,
            registry: MethodRegistry::new(),
            state: ArcSwap::from_pointee(DispatchState::Disconnected),
        });
        let dispatcher = tokio::spawn(Arc::clone(&inner).dispatch_loop());

        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Registers a returning method: callers get its result or its error.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(name, Arc::new(FnHandler::new(handler)))
    }

    /// Registers a non-returning method: invoked, result discarded, nothing
    /// published even on failure.
    pub fn subscribe<F, Fut>(&self, name: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.subscribe_handler(name, Arc::new(FnHandler::new(handler)))
    }

    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &Self {
        self.inner.registry.register(name, handler, true);
        self
    }

    pub fn subscribe_handler(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> &Self {
        self.inner.registry.register(name, handler, false);
        self
    }

    /// Waits until `close()` is called from elsewhere.
    pub async fn run_forever(&self) {
        self.inner.connection.lifecycle().stopped().await;
    }

    /// Stops polling, joins the dispatch task, then waits up to
    /// `drain_timeout` for running workers. Idempotent.
    pub async fn close(&self) {
        if self.inner.connection.close() {
            info!(service = %self.inner.connection.service(), "closing rpc server");
        }
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(err) = handle.await {
                warn!(error = %err, "dispatch loop ended abnormally");
            }
        }
        let lifecycle = self.inner.connection.lifecycle();
        if !lifecycle.wait_for_drain(self.inner.config.drain_timeout).await {
            warn!(
                in_flight = lifecycle.in_flight_count(),
                "drain timeout expired with workers still running"
            );
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        **self.inner.state.load()
    }

    #[must_use]
    pub fn connection_id(&self) -> &ConnectionId {
        self.inner.connection.connection_id()
    }

    #[must_use]
    pub fn service(&self) -> &str {
        self.inner.connection.service()
    }

    /// Registered method names, sorted.
    #[must_use]
    pub fn registered_methods(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Workers currently running.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner.connection.lifecycle().in_flight_count()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.connection.is_running()
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.inner.connection.close();
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("connection", &self.inner.connection)
            .field("state", &self.state())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

impl ServerInner {
    fn set_state(&self, state: DispatchState) {
        self.state.store(Arc::new(state));
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut shutdown = self.connection.lifecycle().shutdown_receiver();
        let mut backoff = Backoff::new(self.config.retry.clone());
        let mut group_ready = false;

        while self.connection.is_running() {
            let cycle = tokio::select! {
                _ = shutdown.changed() => break,
                cycle = self.run_cycle(&mut group_ready) => cycle,
            };
            match cycle {
                Ok(()) => backoff.reset(),
                Err(err) => {
                    self.set_state(DispatchState::Disconnected);
                    if matches!(err, BrokerError::NoGroup { .. }) {
                        group_ready = false;
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        service = %self.connection.service(),
                        attempt = backoff.attempts(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "dispatch cycle failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(DispatchState::Disconnected);
        debug!(service = %self.connection.service(), "dispatch loop stopped");
    }

    /// One pass: health check, group, poll, ack, dispatch.
    async fn run_cycle(self: &Arc<Self>, group_ready: &mut bool) -> Result<(), BrokerError> {
        if let Err(err) = self.connection.ping().await {
            self.set_state(DispatchState::Disconnected);
            warn!(error = %err, "broker health check failed, reconnecting");
            self.connection.reconnect().await?;
            *group_ready = false;
        }

        let broker = self.connection.broker();
        let stream = self.connection.request_stream();
        let group = self.config.group_name.as_str();

        if !*group_ready {
            self.set_state(DispatchState::Subscribing);
            if broker.create_group(&stream, group).await? {
                info!(stream = %stream, group, "created consumer group");
            }
            *group_ready = true;
        }

        let mut permit = match &self.workers {
            Some(workers) => match Arc::clone(workers).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_closed) => return Ok(()),
            },
            None => None,
        };

        self.set_state(DispatchState::Polling);
        let consumer = self.connection.connection_id().as_str();
        let messages = broker
            .read_group(&stream, group, consumer, 1, self.config.poll_interval)
            .await?;
        if messages.is_empty() {
            return Ok(());
        }

        // Entries read with `>` are never redelivered, so a failed ack only
        // leaves them in the group's pending list; the requests still run.
        let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
        if let Err(err) = broker.ack(&stream, group, &ids).await {
            warn!(error = %err, ?ids, "failed to acknowledge requests");
        }

        self.set_state(DispatchState::Dispatching);
        for message in messages {
            match message.payload {
                Some(payload) => self.spawn_worker(payload, permit.take()),
                None => warn!(id = %message.id, "dropping stream entry without payload"),
            }
        }
        Ok(())
    }

    fn spawn_worker(self: &Arc<Self>, payload: Vec<u8>, permit: Option<OwnedSemaphorePermit>) {
        let in_flight = self.connection.lifecycle().in_flight_guard();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let _in_flight = in_flight;
            let _permit = permit;
            inner.handle_request(&payload).await;
        });
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    async fn handle_request(&self, payload: &[u8]) {
        let (mut request, format) = match decode_any::<Request>(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping malformed request");
                return;
            }
        };

        let span = info_span!(
            "rpc_request",
            method = %request.method,
            request_id = %request.request_id,
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );

        async move {
            let start = Instant::now();
            let service = self.connection.service();

            let Some(method) = self.registry.get(&request.method) else {
                tracing::Span::current().record("outcome", "not_registered");
                warn!(method = %request.method, "method not registered");
                if request.expects_reply {
                    let response = Response::not_registered(service, request.request_id.clone(), &request.method);
                    self.reply(&request, &response, format).await;
                }
                return;
            };

            let args = request.take_args();
            let outcome = AssertUnwindSafe(method.handler.call(args)).catch_unwind().await;
            let response = match outcome {
                Ok(Ok(value)) => Response::ok(service, request.request_id.clone(), value),
                Ok(Err(err)) => {
                    warn!(error = %err, "handler failed");
                    Response::error(service, request.request_id.clone(), err.to_string())
                }
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!(panic = %message, "handler panicked");
                    Response::error(service, request.request_id.clone(), message)
                }
            };

            let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            let outcome = if response.is_ok() { "ok" } else { "error" };
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome);
            debug!(duration_ms, outcome, "request handled");

            if method.returns && request.expects_reply {
                self.reply(&request, &response, format).await;
            }
        }
        .instrument(span)
        .await;
    }

    /// Publishes `response` on the caller's response channel in `format`.
    async fn reply(&self, request: &Request, response: &Response, format: WireFormat) {
        if !self.connection.is_running() {
            debug!("server closed, dropping reply");
            return;
        }
        let channel = self.connection.namespace().response_channel(&request.client_id);
        let payload = match format.encode(response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "result not encodable, replying with error");
                let fallback = Response::error(
                    response.service.clone(),
                    response.request_id.clone(),
                    format!("failed to encode result: {err}"),
                );
                match format.encode(&fallback) {
                    Ok(payload) => payload,
                    Err(err) => {
                        error!(error = %err, "failed to encode error reply");
                        return;
                    }
                }
            }
        };
        match self.connection.broker().publish(&channel, &payload).await {
            Ok(0) => debug!(channel = %channel, "reply published with no subscriber"),
            Ok(_) => {}
            Err(err) => warn!(channel = %channel, error = %err, "failed to publish reply"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use callite_core::args;

    const STREAM: &str = "/callite/request/svc";

    fn config() -> RpcConfig {
        let mut config = RpcConfig::new("memory://", "svc");
        config.poll_interval = Duration::from_millis(20);
        config.retry.initial_backoff = Duration::from_millis(5);
        config.retry.max_backoff = Duration::from_millis(20);
        config.drain_timeout = Duration::from_secs(1);
        config
    }

    async fn server(broker: &MemoryBroker) -> RpcServer {
        RpcServer::with_connector(config(), Arc::new(broker.clone()))
            .await
            .unwrap()
    }

    async fn wait_for_state(server: &RpcServer, state: DispatchState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while server.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn add(args: CallArgs) -> anyhow::Result<Value> {
        let a: i64 = args.get(0)?;
        let b: i64 = args.get(1)?;
        Ok(Value::from(a + b))
    }

    #[test]
    fn panic_message_extracts_text() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*boxed), "handler panicked");
    }

    #[tokio::test]
    async fn starts_polling_and_creates_group() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        wait_for_state(&server, DispatchState::Polling).await;
        assert!(!broker.create_group(STREAM, "generic").await.unwrap());
        server.close().await;
        assert_eq!(server.state(), DispatchState::Disconnected);
    }

    #[tokio::test]
    async fn register_chains_and_lists_methods() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        server
            .register("add", add)
            .subscribe("log", |_args| async { Ok::<_, anyhow::Error>(Value::Nil) });
        assert_eq!(server.registered_methods(), vec!["add".to_string(), "log".to_string()]);
        server.close().await;
    }

    #[tokio::test]
    async fn acknowledges_before_dispatch() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        server.register("add", add);
        wait_for_state(&server, DispatchState::Polling).await;

        let request = Request::call("add", ConnectionId::generate(), args![1, 2]);
        broker
            .append(STREAM, &WireFormat::MsgPack.encode(&request).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.pending_count(STREAM, "generic"), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn dispatches_even_when_ack_fails() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        server.register("add", add);
        wait_for_state(&server, DispatchState::Polling).await;
        broker.fail_acks(true);

        let client_id = ConnectionId::generate();
        let mut replies = broker
            .subscribe(&format!("/callite/response/{client_id}"))
            .await
            .unwrap();
        let request = Request::call("add", client_id, args![4, 5]);
        broker
            .append(STREAM, &WireFormat::MsgPack.encode(&request).unwrap())
            .await
            .unwrap();

        let payload = replies.next_message(Duration::from_secs(2)).await.unwrap().unwrap();
        let (response, _): (Response, _) = decode_any(&payload).unwrap();
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.into_result(), Ok(Value::from(9)));
        assert_eq!(broker.pending_count(STREAM, "generic"), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn replies_in_request_format() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        server.register("add", add);
        wait_for_state(&server, DispatchState::Polling).await;

        let client_id = ConnectionId::generate();
        let mut replies = broker
            .subscribe(&format!("/callite/response/{client_id}"))
            .await
            .unwrap();
        let request = Request::call("add", client_id, args![2, 3]);
        broker
            .append(STREAM, &WireFormat::Json.encode(&request).unwrap())
            .await
            .unwrap();

        let payload = replies.next_message(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(payload.first(), Some(&b'{'));
        let (response, _): (Response, _) = decode_any(&payload).unwrap();
        assert_eq!(response.request_id, request.request_id);
        assert_eq!(response.service, "svc");
        assert_eq!(response.into_result(), Ok(Value::from(5)));
        server.close().await;
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        server.register("add", add);
        wait_for_state(&server, DispatchState::Polling).await;

        broker.append(STREAM, b"not an envelope").await.unwrap();

        let client_id = ConnectionId::generate();
        let mut replies = broker
            .subscribe(&format!("/callite/response/{client_id}"))
            .await
            .unwrap();
        let request = Request::call("add", client_id, args![20, 22]);
        broker
            .append(STREAM, &WireFormat::MsgPack.encode(&request).unwrap())
            .await
            .unwrap();

        let payload = replies.next_message(Duration::from_secs(2)).await.unwrap().unwrap();
        let (response, _): (Response, _) = decode_any(&payload).unwrap();
        assert_eq!(response.into_result(), Ok(Value::from(42)));
        server.close().await;
    }

    #[tokio::test]
    async fn worker_limit_bounds_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let broker = MemoryBroker::new();
        let mut config = config();
        config.max_concurrent_workers = Some(1);
        let server = RpcServer::with_connector(config, Arc::new(broker.clone()))
            .await
            .unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        {
            let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
            server.subscribe("work", move |_args| {
                let (running, peak, done) = (Arc::clone(&running), Arc::clone(&peak), Arc::clone(&done));
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(Value::Nil)
                }
            });
        }
        wait_for_state(&server, DispatchState::Polling).await;

        for _ in 0..4 {
            let request = Request::notification("work", ConnectionId::generate(), args![]);
            broker
                .append(STREAM, &WireFormat::MsgPack.encode(&request).unwrap())
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        server.close().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_forever_returns_after_close() {
        let broker = MemoryBroker::new();
        let server = Arc::new(server(&broker).await);
        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run_forever().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        server.close().await;
        server.close().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn reconnects_after_outage() {
        let broker = MemoryBroker::new();
        let server = server(&broker).await;
        wait_for_state(&server, DispatchState::Polling).await;
        let connects = broker.connect_count();

        broker.set_available(false);
        wait_for_state(&server, DispatchState::Disconnected).await;
        broker.set_available(true);
        wait_for_state(&server, DispatchState::Polling).await;

        assert!(broker.connect_count() > connects);
        server.close().await;
    }
}
