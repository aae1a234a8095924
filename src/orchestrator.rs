//! One execution from request to settled bill.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::accounts::{AccountStore, Capabilities};
use crate::bridge::Bridge;
use crate::budget::Budgeter;
use crate::error::{ExecError, Result};
use crate::launcher::{LaunchSpec, Launcher, Stdio};
use crate::ledger::Ledger;
use crate::mounter::Mounter;
use crate::pricing::{Pricer, Usage};
use crate::process::{ExitStatus, Rusage};
use crate::scripts::ScriptStore;
use crate::services::{Invocation, InvocationReport, Registry, ServiceEnv, ServiceKind, Spawner};

/// Upper bound on any single execution, whatever the balance buys.
pub const DEFAULT_TIME_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub owner: String,
    pub name: String,
    pub executing_account: String,
    /// Key of the executing account; needed when the script touches its funds.
    pub credential: Option<String>,
    pub input: Vec<u8>,
    /// Opaque, handed to the script unchanged.
    pub context: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    #[serde(skip)]
    pub stdout: Vec<u8>,
    #[serde(skip)]
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub time_limit_exceeded: bool,
    pub real_time: Duration,
    pub rusage: Rusage,
    /// Amount debited from `billed_account`.
    pub cost: i64,
    pub billed_account: String,
    pub report: InvocationReport,
}

pub struct Orchestrator {
    launcher: Arc<Launcher>,
    scripts: Arc<dyn ScriptStore>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn Ledger>,
    bridge: Arc<dyn Bridge>,
    pricer: Arc<dyn Pricer>,
    mounter: Mounter,
    budgeter: Option<Budgeter>,
    time_cap: Duration,
}

impl Orchestrator {
    pub fn new(
        launcher: Arc<Launcher>,
        scripts: Arc<dyn ScriptStore>,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn Ledger>,
        bridge: Arc<dyn Bridge>,
        pricer: Arc<dyn Pricer>,
        mounter: Mounter,
    ) -> Self {
        Self {
            launcher,
            scripts,
            accounts,
            ledger,
            bridge,
            pricer,
            mounter,
            budgeter: None,
            time_cap: DEFAULT_TIME_CAP,
        }
    }

    /// Also bound each execution by the executing user's allowance.
    pub fn with_budgeter(mut self, budgeter: Budgeter) -> Self {
        self.budgeter = Some(budgeter);
        self
    }

    pub fn with_time_cap(mut self, cap: Duration) -> Self {
        self.time_cap = cap;
        self
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let script = self.scripts.open(&request.owner, &request.name).await?;

        let traits = self.accounts.profile(&script.owner).await?.traits;
        let granted = self
            .accounts
            .profile(&request.executing_account)
            .await?
            .capabilities;
        let capabilities = Capabilities::effective(&script.meta.capabilities, &granted)?;
        if capabilities.touches_executor() {
            self.authenticate(&request).await?;
        }
        if capabilities.escrow {
            let available = self.ledger.balance(&request.executing_account).await?;
            if available < capabilities.withdrawal_limit {
                return Err(ExecError::FailedPrecondition(format!(
                    "escrow needs {} but the executing account holds {available}",
                    capabilities.withdrawal_limit
                )));
            }
        }

        let storage = self
            .mounter
            .mount(&script.owner)
            .await
            .map_err(ExecError::internal)?;

        let billed_account = if capabilities.bill_to_executor {
            request.executing_account.clone()
        } else {
            script.owner.clone()
        };
        let balance = self.ledger.balance(&billed_account).await?;
        if balance <= 0 {
            return Err(ExecError::FailedPrecondition(format!(
                "insufficient funds in {billed_account}"
            )));
        }

        let ceiling = self.pricer.max_usage(balance);
        let mut deadline = ceiling
            .real_time
            .min(Duration::from_secs(traits.time_limit_seconds))
            .min(self.time_cap);
        if let Some(budgeter) = &self.budgeter {
            let allowance = budgeter
                .remaining(&request.executing_account)
                .await
                .map_err(ExecError::internal)?;
            if allowance <= 0 {
                return Err(ExecError::FailedPrecondition(format!(
                    "{} is out of allowance",
                    request.executing_account
                )));
            }
            deadline = deadline.min(self.pricer.max_usage(allowance).real_time);
        }
        if deadline.is_zero() {
            return Err(ExecError::FailedPrecondition(
                "balance does not cover any execution time".into(),
            ));
        }
        let memory_limit = traits.memory_limit.min(ceiling.memory);

        // Everything the script may call is registered before it starts.
        let started = Instant::now();
        let invocation = Arc::new(Invocation::new());
        let env = Arc::new(ServiceEnv {
            ledger: self.ledger.clone(),
            bridge: self.bridge.clone(),
            traits: traits.clone(),
            capabilities,
            owner_account: script.owner.clone(),
            executing_account: request.executing_account.clone(),
            billing_account: billed_account.clone(),
            invocation: invocation.clone(),
        });
        let spawner = traits
            .allowed_services
            .contains(ServiceKind::Supervisor.as_str())
            .then(|| Spawner {
                launcher: self.launcher.clone(),
                scripts: self.scripts.clone(),
                owner: script.owner.clone(),
                storage: storage.clone(),
                traits: traits.clone(),
                memory_limit,
                deadline: started + deadline,
                context: request.context.clone(),
            });
        let registry = Registry::for_invocation(env, request.context.clone(), spawner);

        info!(
            owner = %script.owner,
            script = %script.name,
            executor = %request.executing_account,
            billed = %billed_account,
            balance,
            deadline_ms = deadline.as_millis() as u64,
            memory_limit,
            "executing script"
        );
        let spec = LaunchSpec {
            scripts_root: self.scripts.root().to_path_buf(),
            storage,
            context: request.context,
            traits,
            memory_limit,
            deadline,
            stdio: Stdio::Capture {
                input: request.input,
            },
            script,
        };
        // A launch failure means no user code ran, so nothing is billed.
        let outcome = self
            .launcher
            .run(spec, Arc::new(registry))
            .await
            .map_err(ExecError::internal)?;

        // Billed on wall time; the script may spend it blocked on services.
        let usage = Usage {
            real_time: outcome.real_time,
            memory: 0,
        };
        let cost = self.pricer.cost(&usage);
        if cost > 0 {
            if let Err(err) = self.ledger.adjust(&billed_account, -cost).await {
                error!(account = %billed_account, cost, error = %err, "execution not billed");
                return Err(err.into());
            }
        }
        if let Some(budgeter) = &self.budgeter {
            if let Err(err) = budgeter.charge(&request.executing_account, cost).await {
                warn!(user = %request.executing_account, cost, error = %err, "allowance not charged");
            }
        }

        let report = invocation.report().await;
        debug!(?report, "invocation report");
        info!(
            status = ?outcome.status,
            time_limit_exceeded = outcome.time_limit_exceeded,
            real_ms = outcome.real_time.as_millis() as u64,
            cost,
            withdrawals = report.withdrawals.len(),
            "execution settled"
        );

        Ok(ExecutionResult {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            status: outcome.status,
            time_limit_exceeded: outcome.time_limit_exceeded,
            real_time: outcome.real_time,
            rusage: outcome.rusage,
            cost,
            billed_account,
            report,
        })
    }

    async fn authenticate(&self, request: &ExecutionRequest) -> Result<()> {
        let Some(credential) = request.credential.as_deref() else {
            return Err(ExecError::PermissionDenied(format!(
                "script uses funds of {} and no credential was given",
                request.executing_account
            )));
        };
        if !self
            .ledger
            .verify_key(&request.executing_account, credential)
            .await?
        {
            return Err(ExecError::PermissionDenied(format!(
                "bad credential for {}",
                request.executing_account
            )));
        }
        Ok(())
    }

    /// Unmount every volume.
    pub async fn shutdown(&self) {
        self.mounter.close().await;
    }
}
