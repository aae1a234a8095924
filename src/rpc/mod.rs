//! Control channel between a sandboxed script and the host.
//!
//! Requests are `{"id", "method": "Service.Method", "params": [obj]}` lines;
//! responses are `{"id", "result", "error"}`. Either side may attach
//! descriptors, see [`codec`].

pub mod client;
pub mod codec;
pub mod server;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::os::fd::OwnedFd;
use thiserror::Error;

pub use client::Client;
pub use server::serve;

/// Errors fatal to one connection.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("stream ended inside a frame")]
    Truncated,

    #[error("frame declared {expected} descriptors but none arrived")]
    MissingDescriptors { expected: usize },

    #[error("frame declared {expected} descriptors, received {received}")]
    DescriptorCount { expected: usize, received: usize },

    #[error("response for unknown request {0}")]
    UnknownRequest(u64),

    #[error("control descriptor is not a unix stream socket")]
    NotASocket,

    #[error("connection closed")]
    Closed,
}

/// Error returned to the caller of a single method; the connection survives.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CallError(pub String);

impl CallError {
    pub fn new(message: impl Into<String>) -> Self {
        CallError(message.into())
    }
}

/// An incoming method call.
#[derive(Debug)]
pub struct Call {
    pub method: String,
    pub params: Value,
    pub fds: Vec<OwnedFd>,
}

impl Call {
    /// Decode the parameter object.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, CallError> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| CallError::new(format!("{}: bad params: {e}", self.method)))
    }
}

/// A result plus the descriptors to send with it.
///
/// The descriptors are closed once the response has been written.
#[derive(Debug, Default)]
pub struct Reply {
    pub body: Value,
    pub fds: Vec<OwnedFd>,
}

impl Reply {
    pub fn json<T: Serialize>(value: T) -> Result<Self, CallError> {
        let body = serde_json::to_value(value)
            .map_err(|e| CallError::new(format!("encode reply: {e}")))?;
        Ok(Reply {
            body,
            fds: Vec::new(),
        })
    }

    pub fn empty() -> Self {
        Reply::default()
    }

    pub fn with_fds(mut self, fds: Vec<OwnedFd>) -> Self {
        self.fds = fds;
        self
    }
}

/// Something that answers calls on a control channel.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, call: Call) -> Result<Reply, CallError>;
}

/// Normalize the positional `params` convention to a single value.
pub(crate) fn unwrap_params(params: Value) -> Result<Value, CallError> {
    match params {
        Value::Array(mut items) => match items.len() {
            0 => Ok(Value::Null),
            1 => Ok(items.remove(0)),
            n => Err(CallError::new(format!(
                "expected a single parameter object, got {n}"
            ))),
        },
        other => Ok(other),
    }
}
