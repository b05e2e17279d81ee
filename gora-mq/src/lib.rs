//! Messaging on top of a broker channel: request/reply RPC with correlation
//! ids and reply queues, and typed pub/sub over a topic exchange.
//!
//! Every component of a process shares one [`BrokerConnection`].

mod config;
mod connection;
mod errors;
pub mod mq_metrics;
mod rpc_client;
mod rpc_methods;
mod rpc_server;
mod topic_client;

pub use config::MqConfig;
pub use connection::BrokerConnection;
pub use errors::{HandlerError, MqError, Result, RpcError};
pub use rpc_client::{RpcClient, RpcClientBuilder, RpcClientOptions, CLIENT_CLOSED};
pub use rpc_methods::{RpcArgs, RpcHandler, RpcMethods};
pub use rpc_server::{RpcServer, RpcServerBuilder, HANDLER_PANICKED};
pub use topic_client::{TopicCallback, TopicClient, TopicClientBuilder, TopicClientOptions};

pub use gora_core::message::{RpcResponse, TopicMessage};
