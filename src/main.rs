//! meterbox - metered script sandbox with an HTTP API.
//!
//! Usage:
//!   meterbox serve [--config PATH] [--port 8080]        # Start HTTP server
//!   meterbox run --owner O --name N [--balance 10000]   # One execution, local ledger
//!   meterbox supervise                                  # Internal: sandbox init

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use clap::{Parser, Subcommand};
use meterbox::config::Config;
use meterbox::launcher::Tool;
use meterbox::ledger::{Ledger, MemoryLedger};
use meterbox::state::AppState;
use meterbox::{http_server, supervisor, ExecutionRequest};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meterbox")]
#[command(about = "Metered script sandbox with HTTP API")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on, overriding the configuration
        #[arg(long)]
        port: Option<u16>,
    },
    /// Execute one script against an in-memory ledger, stdin to stdout
    Run {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        /// Defaults to the owner
        #[arg(long)]
        executor: Option<String>,
        /// Balance given to every involved account
        #[arg(long, default_value = "10000")]
        balance: i64,
        /// JSON context handed to the script
        #[arg(long, default_value = "{}")]
        context: String,
    },
    /// Sandbox initialisation; started by the launcher, not by hand
    #[command(hide = true)]
    Supervise,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Single-threaded on purpose: the supervisor clones into new namespaces.
    if let Commands::Supervise = args.command {
        if let Err(e) = supervisor::run() {
            error!(error = %e, "supervisor failed");
            exit(1);
        }
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {}", e);
                exit(1);
            }
        },
        None => Config::default(),
    };

    if !matches!(config.launcher.tool, Tool::Unconfined) && !nix::unistd::geteuid().is_root() {
        eprintln!("Error: Must run as root (need CAP_SYS_ADMIN for namespaces)");
        exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: runtime: {}", e);
            exit(1);
        }
    };
    let code = runtime.block_on(async move {
        match args.command {
            Commands::Serve { port } => serve(config, port).await,
            Commands::Run {
                owner,
                name,
                executor,
                balance,
                context,
            } => run_once(config, owner, name, executor, balance, context).await,
            Commands::Supervise => 1,
        }
    });
    exit(code);
}

async fn serve(config: Config, port: Option<u16>) -> i32 {
    let ledger = config.ledger().await;
    let orchestrator = match config.orchestrator(ledger).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let port = port.unwrap_or(config.server.port);
    match http_server::run_server(port, AppState::new(orchestrator)).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

async fn run_once(
    config: Config,
    owner: String,
    name: String,
    executor: Option<String>,
    balance: i64,
    context: String,
) -> i32 {
    let context = match serde_json::from_str(&context) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("Error: --context is not JSON: {}", e);
            return 1;
        }
    };
    let executing_account = executor.unwrap_or_else(|| owner.clone());

    let ledger = MemoryLedger::new();
    ledger.open_account(&owner, balance, None).await;
    if executing_account != owner {
        ledger.open_account(&executing_account, balance, None).await;
    }
    let ledger: Arc<dyn Ledger> = Arc::new(ledger);
    let orchestrator = match config.orchestrator(ledger.clone()).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let mut input = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut input) {
        eprintln!("Error: stdin: {}", e);
        return 1;
    }

    let request = ExecutionRequest {
        owner: owner.clone(),
        name,
        executing_account,
        credential: None,
        input,
        context,
    };
    let result = orchestrator.execute(request).await;
    orchestrator.shutdown().await;
    match result {
        Ok(result) => {
            let _ = std::io::stdout().write_all(&result.stdout);
            let _ = std::io::stderr().write_all(&result.stderr);
            let remaining = ledger.balance(&result.billed_account).await.unwrap_or_default();
            eprintln!(
                "[meterbox] status={:?} time_limit_exceeded={} cost={} balance={}",
                result.status, result.time_limit_exceeded, result.cost, remaining
            );
            match result.status.exit_code {
                Some(code) => code,
                None => 128 + result.status.signal.unwrap_or(0),
            }
        }
        Err(e) => {
            eprintln!("Error: {} ({})", e, e.code());
            1
        }
    }
}
