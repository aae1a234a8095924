//! Read-only lookups: `NetworkInfo` and `Stats` are proxied to the bridge,
//! `Accounts` resolves chat users to account handles via the ledger.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{encode_handle, ledger_error, unknown_method, ServiceKind};
use crate::bridge::{Bridge, BridgeError};
use crate::ledger::Ledger;
use crate::rpc::{Call, CallError, Reply};

const NETWORK_INFO_METHODS: [&str; 5] = [
    "GetUserInfo",
    "GetChannelInfo",
    "GetGroupInfo",
    "GetChannelMemberInfo",
    "GetGroupMemberInfo",
];

const STATS_METHODS: [&str; 1] = ["GetUserChannelStats"];

async fn proxy(
    bridge: &dyn Bridge,
    kind: ServiceKind,
    allowed: &[&str],
    method: &str,
    params: &Value,
) -> Result<Reply, CallError> {
    if !allowed.contains(&method) {
        return Err(unknown_method(kind, method));
    }
    let body = bridge
        .query(&format!("{kind}.{method}"), params)
        .await
        .map_err(|err| match err {
            BridgeError::Unconfigured => CallError::new(format!("{kind} is not available")),
            other => {
                warn!(error = %other, %kind, method, "bridge query failed");
                CallError::new(format!("{kind}.{method} failed"))
            }
        })?;
    Ok(Reply {
        body,
        fds: Vec::new(),
    })
}

pub struct NetworkInfoService {
    bridge: Arc<dyn Bridge>,
}

impl NetworkInfoService {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self { bridge }
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        proxy(
            self.bridge.as_ref(),
            ServiceKind::NetworkInfo,
            &NETWORK_INFO_METHODS,
            method,
            &call.params,
        )
        .await
    }
}

pub struct StatsService {
    bridge: Arc<dyn Bridge>,
}

impl StatsService {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self { bridge }
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        proxy(
            self.bridge.as_ref(),
            ServiceKind::Stats,
            &STATS_METHODS,
            method,
            &call.params,
        )
        .await
    }
}

#[derive(Deserialize)]
struct Lookup {
    #[serde(rename = "userID")]
    user_id: String,
}

pub struct AccountsService {
    ledger: Arc<dyn Ledger>,
}

impl AccountsService {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        match method {
            "Lookup" => {
                let req: Lookup = call.params()?;
                let account = self
                    .ledger
                    .lookup_user(&req.user_id)
                    .await
                    .map_err(ledger_error)?
                    .ok_or_else(|| CallError::new(format!("no account for user {:?}", req.user_id)))?;
                Reply::json(encode_handle(&account))
            }
            other => Err(unknown_method(ServiceKind::Accounts, other)),
        }
    }
}
