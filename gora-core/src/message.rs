use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// Per-message metadata carried next to the body.
///
/// The RPC layer uses `correlation_id` to match replies with the request that
/// produced them, and `reply_to` to tell the server which queue the reply goes to.
/// Neither of them is ever part of the serialized body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// A message handed by the broker to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    // monotonic per broker, useful for tracing only (deliveries are auto-acked)
    pub delivery_tag: u64,
    // empty for messages sent directly to a queue
    pub exchange: String,
    // the queue name for direct sends, the publish routing key otherwise
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// RPC request body: `{"method": "...", "args": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        RpcRequest {
            method: method.into(),
            args,
        }
    }
}

/// Wire code of each [`RpcResponse`] variant. The code space is closed.
pub const CODE_SUCCESS: u8 = 0;
pub const CODE_FAILURE: u8 = 1;
pub const CODE_TIMEOUT: u8 = 2;
pub const CODE_UNKNOWN_METHOD: u8 = 3;

/// Terminal outcome of an RPC call.
///
/// Serialized as `{code: 0, data}`, `{code: 1, data: "reason"}`, `{code: 2}` or `{code: 3}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRpcResponse", into = "RawRpcResponse")]
pub enum RpcResponse {
    Success(Value),
    Failure(String),
    Timeout,
    UnknownMethod,
}

impl RpcResponse {
    pub fn success(data: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(RpcResponse::Success(serde_json::to_value(data)?))
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        RpcResponse::Failure(reason.into())
    }

    pub fn code(&self) -> u8 {
        match self {
            RpcResponse::Success(_) => CODE_SUCCESS,
            RpcResponse::Failure(_) => CODE_FAILURE,
            RpcResponse::Timeout => CODE_TIMEOUT,
            RpcResponse::UnknownMethod => CODE_UNKNOWN_METHOD,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RpcResponse::Success(_))
    }
}

impl Display for RpcResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RpcResponse::Success(data) => write!(f, "success: {}", data),
            RpcResponse::Failure(reason) => write!(f, "failure: {}", reason),
            RpcResponse::Timeout => write!(f, "timeout"),
            RpcResponse::UnknownMethod => write!(f, "unknown method"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawRpcResponse {
    code: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl TryFrom<RawRpcResponse> for RpcResponse {
    type Error = String;

    fn try_from(raw: RawRpcResponse) -> Result<Self, Self::Error> {
        match raw.code {
            CODE_SUCCESS => Ok(RpcResponse::Success(raw.data.unwrap_or(Value::Null))),
            CODE_FAILURE => match raw.data {
                Some(Value::String(reason)) => Ok(RpcResponse::Failure(reason)),
                Some(other) => Ok(RpcResponse::Failure(other.to_string())),
                None => Ok(RpcResponse::Failure(String::new())),
            },
            CODE_TIMEOUT => Ok(RpcResponse::Timeout),
            CODE_UNKNOWN_METHOD => Ok(RpcResponse::UnknownMethod),
            other => Err(format!("unknown rpc response code: {}", other)),
        }
    }
}

impl From<RpcResponse> for RawRpcResponse {
    fn from(response: RpcResponse) -> Self {
        let code = response.code();
        let data = match response {
            RpcResponse::Success(data) => Some(data),
            RpcResponse::Failure(reason) => Some(Value::String(reason)),
            RpcResponse::Timeout | RpcResponse::UnknownMethod => None,
        };
        RawRpcResponse { code, data }
    }
}

/// Topic message body: `{"type": "...", "data": ...}`.
///
/// A single queue receives every kind of message bound to it, `msg_type`
/// is what selects the local callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: Value,
}

impl TopicMessage {
    pub fn new(msg_type: impl Into<String>, data: Value) -> Self {
        TopicMessage {
            msg_type: msg_type.into(),
            data,
        }
    }
}
