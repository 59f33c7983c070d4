//! Error types for broker access and RPC calls.

use std::time::Duration;

use callite_core::CodecError;

/// Errors raised by a `Broker` backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker could not be reached, or the link dropped.
    #[error("broker connection failed: {0}")]
    Connection(String),
    /// A consumer group read targeted a group that does not exist.
    #[error("consumer group '{group}' does not exist on '{stream}'")]
    NoGroup { stream: String, group: String },
    /// The response subscription ended and must be re-established.
    #[error("subscription closed")]
    SubscriptionClosed,
    /// The broker rejected a command.
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
}

impl BrokerError {
    /// Whether the failure is a lost or missing connection.
    #[must_use]
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SubscriptionClosed)
    }
}

/// Errors surfaced to callers of `RpcClient` and `RpcServer`.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The broker was unreachable when connecting.
    #[error("connection error: {0}")]
    Connection(#[source] BrokerError),
    /// No response arrived within the call's window.
    #[error("call to '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    /// The remote side answered with an error: the handler's message, or
    /// a "Method X not registered" notice.
    #[error("{0}")]
    Remote(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The client or server has been closed.
    #[error("connection closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A successful result did not deserialize into the requested type.
    #[error("unexpected result type: {0}")]
    Result(#[source] rmpv::ext::Error),
}

impl RpcError {
    /// The remote handler's message, if this is a remote error.
    #[must_use]
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::Remote(msg) => Some(msg),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_displays_bare_message() {
        let err = RpcError::Remote("bad".to_string());
        assert_eq!(err.to_string(), "bad");
        assert_eq!(err.remote_message(), Some("bad"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_names_method() {
        let err = RpcError::Timeout {
            method: "add".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("'add'"));
        assert!(err.remote_message().is_none());
    }

    #[test]
    fn connection_classification() {
        assert!(BrokerError::Connection("refused".into()).is_connection());
        assert!(BrokerError::SubscriptionClosed.is_connection());
        assert!(!BrokerError::Command("WRONGTYPE".into()).is_connection());
        assert!(!BrokerError::NoGroup {
            stream: "s".into(),
            group: "g".into()
        }
        .is_connection());
    }
}
