use crate::errors::HandlerError;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// An RPC method implementation.
///
/// Any `Fn(RpcArgs) -> impl Future<Output = Result<Value, HandlerError>>`
/// closure is a handler.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, args: RpcArgs) -> Result<Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn call(&self, args: RpcArgs) -> Result<Value, HandlerError> {
        (self)(args).await
    }
}

/// Method name to handler table served by an `RpcServer`.
#[derive(Clone, Default)]
pub struct RpcMethods {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcMethods {
    pub fn new() -> Self {
        RpcMethods::default()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register(mut self, name: impl Into<String>, handler: impl RpcHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for RpcMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcMethods")
            .field("methods", &self.names())
            .finish()
    }
}

/// Positional arguments of an RPC request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcArgs(Vec<Value>);

impl RpcArgs {
    pub fn new(args: Vec<Value>) -> Self {
        RpcArgs(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Decodes the argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> Result<T, HandlerError> {
        let value = self
            .0
            .get(index)
            .ok_or(HandlerError::MissingArgument(index))?;
        serde_json::from_value(value.clone())
            .map_err(|source| HandlerError::InvalidArgument { index, source })
    }

    /// Like `get`, but a missing or `null` argument yields `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, HandlerError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }
}
