//! Callite: RPC over a shared message broker: request streams read through
//! competing consumer groups, replies on per-connection response channels.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod pending;
pub mod registry;
pub mod retry;
pub mod server;

pub use broker::{
    connector_for_url, Broker, BrokerConnector, MemoryBroker, RedisBroker, RedisConnector,
    StreamMessage, Subscription,
};
pub use callite_core::{args, CallArgs, ConnectionId, RequestId, Value, WireFormat};
pub use client::RpcClient;
pub use config::RpcConfig;
pub use error::{BrokerError, RpcError};
pub use registry::{FnHandler, Handler};
pub use retry::RetryPolicy;
pub use server::{DispatchState, RpcServer};
