//! Server configuration, read from a TOML file.
//!
//! Every section has defaults, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::accounts::FileAccountStore;
use crate::bridge::{Bridge, HttpBridge, LogBridge};
use crate::budget::{BudgetConfig, Budgeter, MemoryBudgetStore};
use crate::launcher::{Launcher, LauncherSettings, SupervisorConfig, Tool, DEFAULT_OUTPUT_LIMIT};
use crate::ledger::{HttpLedger, Ledger, MemoryLedger};
use crate::mounter::{Mounter, VolumeConfig};
use crate::orchestrator::{Orchestrator, DEFAULT_TIME_CAP};
use crate::pricing::{Factor, FactorPricer, PricingError};
use crate::scripts::FsScriptStore;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Pricing(#[from] PricingError),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub launcher: LauncherConfig,
    pub pricing: PricingConfig,
    /// Per-user allowance; off unless present.
    pub budget: Option<BudgetConfig>,
    pub storage: StorageConfig,
    pub ledger: LedgerConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    pub tool: Tool,
    /// Bytes, per stream.
    pub output_limit: usize,
    pub time_cap_seconds: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            tool: Tool::Supervisor(SupervisorConfig {
                executable: None,
                chroot: PathBuf::from("/var/lib/meterbox/rootfs"),
                staging: PathBuf::from("/run/meterbox"),
                cgroup_parent: None,
                denied_syscalls: crate::seccomp::default_denied(),
            }),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            time_cap_seconds: DEFAULT_TIME_CAP.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Cost units per millisecond of wall time.
    pub time: Factor,
    /// Cost units per byte of memory ceiling.
    pub memory: Option<Factor>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            time: Factor::new(1, 1),
            memory: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub scripts: PathBuf,
    pub accounts: PathBuf,
    pub library: PathBuf,
    pub volumes: VolumeConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scripts: PathBuf::from("/var/lib/meterbox/scripts"),
            accounts: PathBuf::from("/var/lib/meterbox/accounts"),
            library: PathBuf::from("/var/lib/meterbox/lib"),
            volumes: VolumeConfig::Directory {
                root: PathBuf::from("/var/lib/meterbox/volumes"),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerConfig {
    Http { url: String },
    /// In-process books, lost on restart.
    Memory {
        #[serde(default)]
        accounts: Vec<SeedAccount>,
    },
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig::Memory {
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedAccount {
    pub id: String,
    #[serde(default)]
    pub balance: i64,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeConfig {
    Http {
        url: String,
    },
    /// Messages are logged and queries refused.
    #[default]
    Log,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub async fn ledger(&self) -> Arc<dyn Ledger> {
        match &self.ledger {
            LedgerConfig::Http { url } => Arc::new(HttpLedger::new(url.clone())),
            LedgerConfig::Memory { accounts } => {
                let ledger = MemoryLedger::new();
                for seed in accounts {
                    ledger
                        .open_account(&seed.id, seed.balance, seed.key.as_deref())
                        .await;
                }
                Arc::new(ledger)
            }
        }
    }

    pub fn bridge(&self) -> Arc<dyn Bridge> {
        match &self.bridge {
            BridgeConfig::Http { url } => Arc::new(HttpBridge::new(url.clone())),
            BridgeConfig::Log => Arc::new(LogBridge),
        }
    }

    pub fn launcher(&self) -> Launcher {
        Launcher::new(LauncherSettings {
            tool: self.launcher.tool.clone(),
            library: self.storage.library.clone(),
            output_limit: self.launcher.output_limit,
        })
    }

    /// Wire every collaborator. Must run inside the runtime.
    pub async fn orchestrator(&self, ledger: Arc<dyn Ledger>) -> Result<Orchestrator, ConfigError> {
        let pricer = FactorPricer::new(self.pricing.time, self.pricing.memory)?;
        let mut orchestrator = Orchestrator::new(
            Arc::new(self.launcher()),
            Arc::new(FsScriptStore::new(&self.storage.scripts)),
            Arc::new(FileAccountStore::new(&self.storage.accounts)),
            ledger,
            self.bridge(),
            Arc::new(pricer),
            Mounter::start(self.storage.volumes.backend()),
        )
        .with_time_cap(Duration::from_secs(self.launcher.time_cap_seconds));
        if let Some(budget) = self.budget {
            info!(max = budget.max, "per-user allowance enabled");
            orchestrator =
                orchestrator.with_budgeter(Budgeter::new(Box::new(MemoryBudgetStore::new()), budget));
        }
        Ok(orchestrator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.budget.is_none());
        assert!(matches!(config.launcher.tool, Tool::Supervisor(_)));
        assert!(matches!(config.bridge, BridgeConfig::Log));
    }

    #[test]
    fn parses_a_full_file() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [launcher]
            time_cap_seconds = 30

            [launcher.tool]
            kind = "nsjail"
            chroot = "/srv/jail"
            rlimit_as_mb = 2048

            [pricing]
            time = { num = 1, den = 10 }

            [budget]
            max = 60000
            payout = { num = 100, den = 1 }

            [storage]
            scripts = "/srv/scripts"

            [storage.volumes]
            kind = "image"
            images = "/srv/images"
            mounts = "/srv/mounts"

            [ledger]
            kind = "memory"
            accounts = [{ id = "alice", balance = 500, key = "k" }]

            [bridge]
            kind = "http"
            url = "http://bridge:7000"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.launcher.time_cap_seconds, 30);
        match &config.launcher.tool {
            Tool::Nsjail(nsjail) => {
                assert_eq!(nsjail.chroot, PathBuf::from("/srv/jail"));
                assert_eq!(nsjail.rlimit_as_mb, 2048);
                assert_eq!(nsjail.path, PathBuf::from("/usr/bin/nsjail"));
            }
            other => panic!("unexpected tool {other:?}"),
        }
        assert_eq!(config.pricing.time, Factor::new(1, 10));
        assert_eq!(config.budget.unwrap().max, 60000);
        assert_eq!(config.storage.scripts, PathBuf::from("/srv/scripts"));
        assert_eq!(
            config.storage.accounts,
            PathBuf::from("/var/lib/meterbox/accounts")
        );
        match &config.storage.volumes {
            VolumeConfig::Image { size, mkfs, .. } => {
                assert_eq!(*size, 20 * 1024 * 1024);
                assert_eq!(mkfs[0], "mkfs.ext4");
            }
            other => panic!("unexpected volumes {other:?}"),
        }
        match &config.ledger {
            LedgerConfig::Memory { accounts } => {
                assert_eq!(accounts[0].id, "alice");
                assert_eq!(accounts[0].balance, 500);
            }
            other => panic!("unexpected ledger {other:?}"),
        }
        assert!(matches!(config.bridge, BridgeConfig::Http { .. }));
    }

    #[tokio::test]
    async fn memory_ledger_is_seeded() {
        let config: Config = toml::from_str(
            r#"
            [ledger]
            kind = "memory"
            accounts = [{ id = "bob", balance = 42 }]
            "#,
        )
        .unwrap();
        let ledger = config.ledger().await;
        assert_eq!(ledger.balance("bob").await.unwrap(), 42);
    }
}
