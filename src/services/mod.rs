//! Mediating services reachable from a sandbox over its control channel.
//!
//! Methods are addressed as `Service.Method`. Which services a script may
//! reach is account policy: `Context` and `Output` are always present, the
//! rest only when named in the account's `allowed_services`.

pub mod context;
pub mod info;
pub mod messaging;
pub mod money;
pub mod output;
pub mod supervisor;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::accounts::{AccountTraits, Capabilities};
use crate::bridge::Bridge;
use crate::ledger::{Ledger, LedgerError};
use crate::rpc::{Call, CallError, Handler, Reply};

pub use context::ContextService;
pub use info::{AccountsService, NetworkInfoService, StatsService};
pub use messaging::MessagingService;
pub use money::MoneyService;
pub use output::OutputService;
pub use supervisor::{Spawner, SupervisorService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceKind {
    Money,
    Context,
    Messaging,
    Output,
    NetworkInfo,
    Stats,
    Accounts,
    Supervisor,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 8] = [
        ServiceKind::Money,
        ServiceKind::Context,
        ServiceKind::Messaging,
        ServiceKind::Output,
        ServiceKind::NetworkInfo,
        ServiceKind::Stats,
        ServiceKind::Accounts,
        ServiceKind::Supervisor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Money => "Money",
            ServiceKind::Context => "Context",
            ServiceKind::Messaging => "Messaging",
            ServiceKind::Output => "Output",
            ServiceKind::NetworkInfo => "NetworkInfo",
            ServiceKind::Stats => "Stats",
            ServiceKind::Accounts => "Accounts",
            ServiceKind::Supervisor => "Supervisor",
        }
    }

    /// Registered regardless of account policy.
    pub fn always_on(&self) -> bool {
        matches!(self, ServiceKind::Context | ServiceKind::Output)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownService(pub String);

impl fmt::Display for UnknownService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown service {:?}", self.0)
    }
}

impl FromStr for ServiceKind {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownService(s.to_string()))
    }
}

/// How the response should be presented, as chosen by the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputParams {
    pub format: String,
    pub private: bool,
    pub expires: bool,
}

impl Default for OutputParams {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
            private: false,
            expires: false,
        }
    }
}

/// Whose funds a transfer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Payer {
    Executor,
    Owner,
    Billing,
    /// An account authorised by key.
    Keyed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Withdrawal {
    pub payer: Payer,
    pub source: String,
    pub target: String,
    pub amount: i64,
}

#[derive(Debug, Default)]
struct Transfers {
    /// Sum of `Charge` amounts against the withdrawal limit.
    charged: i64,
    log: Vec<Withdrawal>,
}

/// Mutable state of one invocation, read back once the sandbox is gone.
#[derive(Debug, Default)]
pub struct Invocation {
    output: Mutex<OutputParams>,
    // Held across the ledger call so concurrent charges cannot both pass
    // the limit check.
    transfers: tokio::sync::Mutex<Transfers>,
    messages_sent: AtomicU32,
}

/// What the invocation did, for the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    pub output: OutputParams,
    pub withdrawals: Vec<Withdrawal>,
    pub messages_sent: u32,
}

impl Invocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report(&self) -> InvocationReport {
        let output = lock(&self.output).clone();
        InvocationReport {
            output,
            withdrawals: self.transfers.lock().await.log.clone(),
            messages_sent: self.messages_sent.load(Ordering::SeqCst),
        }
    }

    fn update_output(&self, f: impl FnOnce(&mut OutputParams)) {
        f(&mut lock(&self.output));
    }

    /// Count one message if under `limit`.
    fn take_message(&self, limit: u32) -> bool {
        self.messages_sent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |sent| {
                (sent < limit).then_some(sent + 1)
            })
            .is_ok()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Inputs shared by every service of one invocation.
pub struct ServiceEnv {
    pub ledger: Arc<dyn Ledger>,
    pub bridge: Arc<dyn Bridge>,
    pub traits: AccountTraits,
    /// Effective capabilities of the running script.
    pub capabilities: Capabilities,
    pub owner_account: String,
    pub executing_account: String,
    pub billing_account: String,
    pub invocation: Arc<Invocation>,
}

impl ServiceEnv {
    pub fn format_allowed(&self, format: &str) -> bool {
        format == "text" || self.traits.allowed_output_formats.contains(format)
    }
}

/// Account handles are the URL-safe base64 of the account id.
pub fn encode_handle(account: &str) -> String {
    URL_SAFE_NO_PAD.encode(account)
}

pub fn decode_handle(handle: &str) -> Result<String, CallError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(handle)
        .map_err(|_| CallError::new("malformed account handle"))?;
    String::from_utf8(bytes).map_err(|_| CallError::new("malformed account handle"))
}

/// Ledger failures as seen by a script. Host detail stays in the log.
pub(crate) fn ledger_error(err: LedgerError) -> CallError {
    match err {
        LedgerError::NotFound(_) => CallError::new("account not found"),
        LedgerError::InvalidAmount(amount) => CallError::new(format!("invalid amount {amount}")),
        LedgerError::InsufficientFunds => CallError::new("insufficient funds"),
        other => {
            warn!(error = %other, "ledger call from sandbox failed");
            CallError::new("ledger unavailable")
        }
    }
}

pub(crate) fn unknown_method(kind: ServiceKind, method: &str) -> CallError {
    CallError::new(format!("unknown method {kind}.{method}"))
}

pub enum Mediator {
    Money(MoneyService),
    Context(ContextService),
    Messaging(MessagingService),
    Output(OutputService),
    NetworkInfo(NetworkInfoService),
    Stats(StatsService),
    Accounts(AccountsService),
    Supervisor(SupervisorService),
}

impl Mediator {
    pub fn kind(&self) -> ServiceKind {
        match self {
            Mediator::Money(_) => ServiceKind::Money,
            Mediator::Context(_) => ServiceKind::Context,
            Mediator::Messaging(_) => ServiceKind::Messaging,
            Mediator::Output(_) => ServiceKind::Output,
            Mediator::NetworkInfo(_) => ServiceKind::NetworkInfo,
            Mediator::Stats(_) => ServiceKind::Stats,
            Mediator::Accounts(_) => ServiceKind::Accounts,
            Mediator::Supervisor(_) => ServiceKind::Supervisor,
        }
    }

    async fn dispatch(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        match self {
            Mediator::Money(s) => s.call(method, call).await,
            Mediator::Context(s) => s.call(method, call),
            Mediator::Messaging(s) => s.call(method, call).await,
            Mediator::Output(s) => s.call(method, call),
            Mediator::NetworkInfo(s) => s.call(method, call).await,
            Mediator::Stats(s) => s.call(method, call).await,
            Mediator::Accounts(s) => s.call(method, call).await,
            Mediator::Supervisor(s) => s.call(method, call).await,
        }
    }
}

/// The services of one control channel.
#[derive(Default)]
pub struct Registry {
    services: BTreeMap<ServiceKind, Mediator>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mediator: Mediator) {
        self.services.insert(mediator.kind(), mediator);
    }

    pub fn kinds(&self) -> Vec<ServiceKind> {
        self.services.keys().copied().collect()
    }

    /// Services granted by the account's policy. `spawner` backs the
    /// `Supervisor` service when the policy names it.
    pub fn for_invocation(env: Arc<ServiceEnv>, context: Value, spawner: Option<Spawner>) -> Self {
        let mut registry = Registry::new();
        registry.register(Mediator::Context(ContextService::new(context)));
        registry.register(Mediator::Output(OutputService::new(env.clone())));

        let mut spawner = spawner;
        for name in &env.traits.allowed_services {
            let kind = match name.parse::<ServiceKind>() {
                Ok(kind) => kind,
                Err(err) => {
                    warn!(%err, "ignoring service in account policy");
                    continue;
                }
            };
            let mediator = match kind {
                ServiceKind::Context | ServiceKind::Output => continue,
                ServiceKind::Money => Mediator::Money(MoneyService::new(env.clone())),
                ServiceKind::Messaging => Mediator::Messaging(MessagingService::new(env.clone())),
                ServiceKind::NetworkInfo => {
                    Mediator::NetworkInfo(NetworkInfoService::new(env.bridge.clone()))
                }
                ServiceKind::Stats => Mediator::Stats(StatsService::new(env.bridge.clone())),
                ServiceKind::Accounts => Mediator::Accounts(AccountsService::new(env.ledger.clone())),
                ServiceKind::Supervisor => match spawner.take() {
                    Some(spawner) => Mediator::Supervisor(SupervisorService::new(spawner)),
                    None => continue,
                },
            };
            registry.register(mediator);
        }
        debug!(services = ?registry.kinds(), "registry built");
        registry
    }

    /// Only the context, for scripts spawned by other scripts.
    pub fn context_only(context: Value) -> Self {
        let mut registry = Registry::new();
        registry.register(Mediator::Context(ContextService::new(context)));
        registry
    }
}

#[async_trait]
impl Handler for Registry {
    /// `call.params` is already the single parameter object; the server
    /// strips the positional array.
    async fn call(&self, call: Call) -> Result<Reply, CallError> {
        let (service, method) = call
            .method
            .split_once('.')
            .ok_or_else(|| CallError::new(format!("malformed method {:?}", call.method)))?;
        let kind: ServiceKind = service
            .parse()
            .map_err(|err: UnknownService| CallError::new(err.to_string()))?;
        let mediator = self
            .services
            .get(&kind)
            .ok_or_else(|| CallError::new(format!("service {kind} not available")))?;
        let method = method.to_string();
        mediator.dispatch(&method, call).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::bridge::LogBridge;
    use crate::ledger::MemoryLedger;

    pub fn call(method: &str, params: Value) -> Call {
        Call {
            method: method.to_string(),
            params,
            fds: Vec::new(),
        }
    }

    pub async fn env(traits: AccountTraits, capabilities: Capabilities) -> (Arc<ServiceEnv>, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.open_account("owner", 1000, None).await;
        ledger.open_account("exec", 1000, Some("secret")).await;
        ledger.open_account("shop", 0, None).await;
        let env = Arc::new(ServiceEnv {
            ledger: ledger.clone(),
            bridge: Arc::new(LogBridge),
            traits,
            capabilities,
            owner_account: "owner".into(),
            executing_account: "exec".into(),
            billing_account: "owner".into(),
            invocation: Arc::new(Invocation::new()),
        });
        (env, ledger)
    }
}
