//! `Messaging`: send a message to a channel or user through the bridge.

use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::{unknown_method, ServiceEnv, ServiceKind};
use crate::bridge::{Message, MessageTarget};
use crate::rpc::{Call, CallError, Reply};

#[derive(Deserialize)]
struct Outgoing {
    id: String,
    content: String,
    #[serde(default)]
    format: String,
}

pub struct MessagingService {
    env: Arc<ServiceEnv>,
}

impl MessagingService {
    pub fn new(env: Arc<ServiceEnv>) -> Self {
        Self { env }
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        let target = match method {
            "MessageChannel" => MessageTarget::Channel,
            "MessageUser" => MessageTarget::User,
            other => return Err(unknown_method(ServiceKind::Messaging, other)),
        };
        let req: Outgoing = call.params()?;
        let format = if req.format.is_empty() { "text" } else { req.format.as_str() };
        if !self.env.format_allowed(format) {
            return Err(CallError::new(format!(
                "format {format:?} is not allowed for this account"
            )));
        }

        let limit = self.env.traits.max_messages_per_invocation;
        if !self.env.invocation.take_message(limit) {
            return Err(CallError::new(format!(
                "message limit of {limit} per invocation reached"
            )));
        }

        let message = Message {
            target,
            id: &req.id,
            content: &req.content,
            format,
        };
        self.env.bridge.send_message(&message).await.map_err(|err| {
            warn!(error = %err, "message delivery failed");
            CallError::new("message delivery failed")
        })?;
        Ok(Reply::empty())
    }
}
