//! `Output`: how the caller should present the script's stdout.

use serde::Deserialize;
use std::sync::Arc;

use super::{unknown_method, ServiceEnv, ServiceKind};
use crate::rpc::{Call, CallError, Reply};

#[derive(Deserialize)]
struct SetFormat {
    format: String,
}

#[derive(Deserialize)]
struct SetPrivate {
    private: bool,
}

#[derive(Deserialize)]
struct SetExpires {
    expires: bool,
}

pub struct OutputService {
    env: Arc<ServiceEnv>,
}

impl OutputService {
    pub fn new(env: Arc<ServiceEnv>) -> Self {
        Self { env }
    }

    pub(super) fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        let invocation = &self.env.invocation;
        match method {
            "SetFormat" => {
                let req: SetFormat = call.params()?;
                if !self.env.format_allowed(&req.format) {
                    return Err(CallError::new(format!(
                        "output format {:?} is not allowed for this account",
                        req.format
                    )));
                }
                invocation.update_output(|o| o.format = req.format);
            }
            "SetPrivate" => {
                let req: SetPrivate = call.params()?;
                invocation.update_output(|o| o.private = req.private);
            }
            "SetExpires" => {
                let req: SetExpires = call.params()?;
                invocation.update_output(|o| o.expires = req.expires);
            }
            other => return Err(unknown_method(ServiceKind::Output, other)),
        }
        Ok(Reply::empty())
    }
}
