//! `Context`: the opaque blob supplied with the request.

use serde_json::Value;

use super::{unknown_method, ServiceKind};
use crate::rpc::{Call, CallError, Reply};

pub struct ContextService {
    context: Value,
}

impl ContextService {
    pub fn new(context: Value) -> Self {
        Self { context }
    }

    pub(super) fn call(&self, method: &str, _call: Call) -> Result<Reply, CallError> {
        match method {
            "Get" => Ok(Reply {
                body: self.context.clone(),
                fds: Vec::new(),
            }),
            other => Err(unknown_method(ServiceKind::Context, other)),
        }
    }
}
