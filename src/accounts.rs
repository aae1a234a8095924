//! Account policy: resource traits and capability grants.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use tracing::debug;

use crate::error::{ExecError, Result};

/// Resource and service policy applied to every execution for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountTraits {
    pub time_limit_seconds: u64,
    /// Bytes.
    pub memory_limit: u64,
    pub open_file_limit: u64,
    pub process_limit: u64,
    /// Bytes; zero means no `/tmp` tmpfs.
    pub tmpfs_size: u64,
    /// cgroup v2 `io.weight`, 1..=10000.
    pub blkio_weight: u32,
    /// cgroup v2 `cpu.weight`, 1..=10000.
    pub cpu_shares: u32,
    pub allow_network_access: bool,
    pub allowed_output_formats: BTreeSet<String>,
    pub allowed_services: BTreeSet<String>,
    pub max_messages_per_invocation: u32,
}

impl Default for AccountTraits {
    fn default() -> Self {
        Self {
            time_limit_seconds: 5,
            memory_limit: 64 * 1024 * 1024,
            open_file_limit: 64,
            process_limit: 32,
            tmpfs_size: 0,
            blkio_weight: 100,
            cpu_shares: 100,
            allow_network_access: false,
            allowed_output_formats: ["text".to_string()].into_iter().collect(),
            allowed_services: BTreeSet::new(),
            max_messages_per_invocation: 5,
        }
    }
}

/// Capabilities either declared by a script or granted by an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Largest total the script may charge the executing account.
    pub withdrawal_limit: i64,
    pub bill_to_executor: bool,
    pub escrow: bool,
}

pub type RequestedCapabilities = Capabilities;
pub type AccountCapabilities = Capabilities;

impl Capabilities {
    /// Intersect what a script asks for with what the account allows.
    pub fn effective(requested: &Capabilities, granted: &Capabilities) -> Result<Capabilities> {
        if requested.withdrawal_limit < 0 {
            return Err(ExecError::InvalidArgument(
                "withdrawal limit must not be negative".into(),
            ));
        }
        if requested.withdrawal_limit > 0 && granted.withdrawal_limit <= 0 {
            return Err(ExecError::PermissionDenied(
                "script needs a withdrawal capability the account does not grant".into(),
            ));
        }
        if requested.bill_to_executor && !granted.bill_to_executor {
            return Err(ExecError::PermissionDenied(
                "script bills the executing account, which does not allow it".into(),
            ));
        }
        if requested.escrow && !granted.escrow {
            return Err(ExecError::PermissionDenied(
                "script needs escrow, which the account does not allow".into(),
            ));
        }
        Ok(Capabilities {
            withdrawal_limit: requested.withdrawal_limit.min(granted.withdrawal_limit.max(0)),
            bill_to_executor: requested.bill_to_executor,
            escrow: requested.escrow,
        })
    }

    /// Whether running with these capabilities touches the executor's funds.
    pub fn touches_executor(&self) -> bool {
        self.withdrawal_limit > 0 || self.bill_to_executor
    }
}

/// Policy as stored for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountProfile {
    pub traits: AccountTraits,
    pub capabilities: AccountCapabilities,
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Policy for `account`; unknown accounts get the default profile.
    async fn profile(&self, account: &str) -> Result<AccountProfile>;
}

/// Profiles read from `<root>/<account>.toml`.
pub struct FileAccountStore {
    root: PathBuf,
}

impl FileAccountStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn profile(&self, account: &str) -> Result<AccountProfile> {
        crate::scripts::validate_name(account)?;
        let path = self.root.join(format!("{account}.toml"));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(account, "no account profile, using defaults");
                return Ok(AccountProfile::default());
            }
            Err(e) => return Err(ExecError::internal(format!("read {}: {e}", path.display()))),
        };
        toml::from_str(&text)
            .map_err(|e| ExecError::internal(format!("parse {}: {e}", path.display())))
    }
}

/// Fixed in-process profiles.
#[derive(Default)]
pub struct MemoryAccountStore {
    profiles: HashMap<String, AccountProfile>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(mut self, account: &str, profile: AccountProfile) -> Self {
        self.profiles.insert(account.to_string(), profile);
        self
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn profile(&self, account: &str) -> Result<AccountProfile> {
        Ok(self.profiles.get(account).cloned().unwrap_or_default())
    }
}
