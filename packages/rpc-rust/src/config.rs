use std::time::Duration;

use callite_core::{WireFormat, DEFAULT_CONSUMER_GROUP, DEFAULT_QUEUE_PREFIX};

use crate::error::RpcError;
use crate::retry::RetryPolicy;

/// Configuration shared by `RpcClient` and `RpcServer`.
///
/// Controls broker addressing, naming, call timeouts, background loop
/// cadence, and reconnect policy.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Broker URL, e.g. `redis://127.0.0.1:6379/0`.
    pub broker_url: String,
    /// Logical service name: the server's request stream, or the client's target.
    pub service: String,
    /// Namespacing root for stream and channel names.
    pub queue_prefix: String,
    /// Competing-consumer group on the request stream.
    pub group_name: String,
    /// Default time `execute()` waits for a response.
    pub execution_timeout: Duration,
    /// Longest single wait of either background loop before it re-checks
    /// whether it should keep running.
    pub poll_interval: Duration,
    /// Reconnect and resubscribe backoff.
    pub retry: RetryPolicy,
    /// Format of outgoing envelopes. Incoming envelopes are auto-detected.
    pub wire_format: WireFormat,
    /// Ceiling on concurrently running server workers. `None` is unbounded.
    pub max_concurrent_workers: Option<usize>,
    /// How long `RpcServer::close()` waits for in-flight workers.
    pub drain_timeout: Duration,
    /// Default log filter used by the binary when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379/0".to_string(),
            service: String::new(),
            queue_prefix: DEFAULT_QUEUE_PREFIX.to_string(),
            group_name: DEFAULT_CONSUMER_GROUP.to_string(),
            execution_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            wire_format: WireFormat::default(),
            max_concurrent_workers: None,
            drain_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

impl RpcConfig {
    #[must_use]
    pub fn new(broker_url: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            service: service.into(),
            ..Self::default()
        }
    }

    /// Defaults overlaid with environment variables.
    ///
    /// Reads `CALLITE_BROKER_URL`, `CALLITE_QUEUE_PREFIX`, `CALLITE_GROUP`,
    /// `EXECUTION_TIMEOUT` (seconds), `CALLITE_WIRE_FORMAT` and `LOG_LEVEL`.
    /// Unparseable numeric or format values are ignored.
    #[must_use]
    pub fn from_env(service: impl Into<String>) -> Self {
        Self::from_lookup(service, |key| std::env::var(key).ok())
    }

    fn from_lookup(service: impl Into<String>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self {
            service: service.into(),
            ..Self::default()
        };
        if let Some(url) = lookup("CALLITE_BROKER_URL") {
            config.broker_url = url;
        }
        if let Some(prefix) = lookup("CALLITE_QUEUE_PREFIX") {
            config.queue_prefix = prefix;
        }
        if let Some(group) = lookup("CALLITE_GROUP") {
            config.group_name = group;
        }
        if let Some(timeout) = lookup("EXECUTION_TIMEOUT")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(timeout_from_secs) {
            config.execution_timeout = timeout;
        }
        if let Some(format) = lookup("CALLITE_WIRE_FORMAT").and_then(|v| v.parse().ok()) {
            config.wire_format = format;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.to_ascii_lowercase();
        }
        config
    }

    /// Checks the settings every component relies on.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.service.is_empty() {
            return Err(RpcError::Config("service name must not be empty".into()));
        }
        if self.queue_prefix.is_empty() {
            return Err(RpcError::Config("queue prefix must not be empty".into()));
        }
        if self.group_name.is_empty() {
            return Err(RpcError::Config("consumer group must not be empty".into()));
        }
        if self.execution_timeout.is_zero() {
            return Err(RpcError::Config("execution timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(RpcError::Config("poll interval must be positive".into()));
        }
        if self.max_concurrent_workers == Some(0) {
            return Err(RpcError::Config("max concurrent workers must be positive".into()));
        }
        Ok(())
    }
}

/// Converts a timeout in seconds, rejecting values that are not positive
/// or do not fit in a `Duration`.
#[must_use]
pub fn timeout_from_secs(secs: f64) -> Option<Duration> {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}
