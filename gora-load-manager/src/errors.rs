use gora_mq::MqError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoadManagerError>;

/// Why an allocation request could not be served. The message is what the
/// RPC caller receives as failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("no agents registered")]
    NoAgentsRegistered,

    #[error("no available worker of requested kind")]
    NoAvailableWorker,

    #[error("no portal available")]
    NoPortalAvailable,
}

#[derive(Debug, Error)]
pub enum LoadManagerError {
    #[error("messaging error: {0}")]
    Mq(#[from] MqError),

    #[error("invalid load manager configuration: {0}")]
    InvalidConfig(String),
}

impl From<AllocationError> for gora_mq::HandlerError {
    fn from(err: AllocationError) -> Self {
        gora_mq::HandlerError::failed(err.to_string())
    }
}
