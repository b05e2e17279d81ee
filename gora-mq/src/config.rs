use gora_core::broker::BrokerConfig;
use serde::{Deserialize, Serialize};

use crate::rpc_client::RpcClientOptions;
use crate::topic_client::TopicClientOptions;

/// Messaging settings of a process: where the broker is and how the RPC and
/// topic clients behave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MqConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rpc: RpcClientOptions,
    #[serde(default)]
    pub topic: TopicClientOptions,
}
