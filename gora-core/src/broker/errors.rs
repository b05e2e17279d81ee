use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed for user: {0}")]
    AuthenticationFailed(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("queue is exclusive to another channel: {0}")]
    ResourceLocked(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),

    #[error("broker protocol error: {0}")]
    Protocol(String),
}
