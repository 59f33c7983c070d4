//! Broker key naming for request streams and response channels.

use crate::envelope::ConnectionId;

/// Default namespacing root for every stream and channel.
pub const DEFAULT_QUEUE_PREFIX: &str = "/callite";

/// Default competing-consumer group on a request stream.
pub const DEFAULT_CONSUMER_GROUP: &str = "generic";

/// Field of the broker message that carries the serialized envelope.
pub const PAYLOAD_FIELD: &str = "data";

/// Derives stream and channel names under a common prefix.
///
/// - request stream: `{prefix}/request/{service}`
/// - response channel: `{prefix}/response/{connection_id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn request_stream(&self, service: &str) -> String {
        format!("{}/request/{service}", self.prefix)
    }

    #[must_use]
    pub fn response_channel(&self, connection_id: &ConnectionId) -> String {
        format!("{}/response/{connection_id}", self.prefix)
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names() {
        let ns = Namespace::default();
        assert_eq!(ns.prefix(), "/callite");
        assert_eq!(ns.request_stream("service"), "/callite/request/service");
        assert_eq!(
            ns.response_channel(&ConnectionId::from("abc123")),
            "/callite/response/abc123"
        );
    }

    #[test]
    fn custom_prefix() {
        let ns = Namespace::new("/staging");
        assert_eq!(ns.request_stream("billing"), "/staging/request/billing");
    }

    #[test]
    fn distinct_identities_get_distinct_channels() {
        let ns = Namespace::default();
        let a = ns.response_channel(&ConnectionId::generate());
        let b = ns.response_channel(&ConnectionId::generate());
        assert_ne!(a, b);
    }
}
