use gora_core::broker::BrokerError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MqError>;

/// Failures of the messaging layer itself. Terminal RPC outcomes
/// (failure, timeout, unknown method) are not errors, see `RpcResponse`.
#[derive(Debug, Error)]
pub enum MqError {
    #[error("unable to connect to the broker: {0}")]
    Connection(#[source] BrokerError),

    #[error("operation attempted before initialization completed")]
    NotReady,

    #[error("channel unavailable")]
    ChannelUnavailable,

    #[error("broker error: {0}")]
    Broker(BrokerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("too many pending calls, all {0} correlation ids are in use")]
    TooManyPendingCalls(u32),
}

impl From<BrokerError> for MqError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::ChannelClosed => MqError::ChannelUnavailable,
            other => MqError::Broker(other),
        }
    }
}

/// Error side of the typed `RpcClient::call`.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc failure: {0}")]
    Failure(String),

    #[error("rpc request timed out")]
    Timeout,

    #[error("unknown rpc method")]
    UnknownMethod,

    #[error("unable to decode rpc payload: {0}")]
    Decode(serde_json::Error),

    #[error(transparent)]
    Mq(#[from] MqError),
}

/// Error returned by an RPC method handler, sent back to the caller as a
/// failure response carrying the error message.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("missing argument at position {0}")]
    MissingArgument(usize),

    #[error("invalid argument at position {index}: {source}")]
    InvalidArgument {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("unable to serialize result: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}
