//! End-to-end executions with the unconfined tool and in-memory collaborators.

use meterbox::accounts::{AccountProfile, AccountTraits, Capabilities, MemoryAccountStore};
use meterbox::bridge::LogBridge;
use meterbox::launcher::{Launcher, LauncherSettings, Tool, DEFAULT_OUTPUT_LIMIT};
use meterbox::ledger::{Ledger, MemoryLedger};
use meterbox::mounter::{DirectoryBackend, Mounter};
use meterbox::pricing::{Factor, FactorPricer};
use meterbox::scripts::FsScriptStore;
use meterbox::services::encode_handle;
use meterbox::{ExecError, ExecutionRequest, Orchestrator};
use serde_json::json;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    ledger: Arc<MemoryLedger>,
    orchestrator: Orchestrator,
}

fn write_script(root: &Path, owner: &str, name: &str, body: &str, meta: Option<&str>) {
    let dir = root.join(owner);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    if let Some(meta) = meta {
        std::fs::write(dir.join(format!("{name}.meta.json")), meta).unwrap();
    }
}

async fn fixture(accounts: MemoryAccountStore, balances: &[(&str, i64, Option<&str>)]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();

    let ledger = Arc::new(MemoryLedger::new());
    for (account, balance, key) in balances {
        ledger.open_account(account, *balance, *key).await;
    }

    let launcher = Launcher::new(LauncherSettings {
        tool: Tool::Unconfined,
        library: dir.path().join("lib"),
        output_limit: DEFAULT_OUTPUT_LIMIT,
    });
    let orchestrator = Orchestrator::new(
        Arc::new(launcher),
        Arc::new(FsScriptStore::new(&scripts)),
        Arc::new(accounts),
        ledger.clone(),
        Arc::new(LogBridge),
        Arc::new(FactorPricer::new(Factor::new(1, 1), None).unwrap()),
        Mounter::start(Box::new(DirectoryBackend::new(dir.path().join("volumes")))),
    );
    Fixture {
        dir,
        ledger,
        orchestrator,
    }
}

impl Fixture {
    fn scripts(&self) -> std::path::PathBuf {
        self.dir.path().join("scripts")
    }
}

fn request(owner: &str, name: &str) -> ExecutionRequest {
    ExecutionRequest {
        owner: owner.into(),
        name: name.into(),
        executing_account: owner.into(),
        credential: None,
        input: Vec::new(),
        context: json!({}),
    }
}

#[tokio::test]
async fn short_run_is_billed_by_wall_time() {
    let fx = fixture(MemoryAccountStore::new(), &[("alice", 1000, None)]).await;
    write_script(&fx.scripts(), "alice", "nap", "#!/bin/sh\nsleep 0.5\necho rested\n", None);

    let result = fx.orchestrator.execute(request("alice", "nap")).await.unwrap();
    assert!(result.status.success(), "{:?}", result.status);
    assert!(!result.time_limit_exceeded);
    assert_eq!(result.stdout, b"rested\n");
    assert!((500..900).contains(&result.cost), "cost {}", result.cost);

    let balance = fx.ledger.balance("alice").await.unwrap();
    assert_eq!(balance, 1000 - result.cost);
    assert_eq!(result.billed_account, "alice");
}

#[tokio::test]
async fn empty_balance_is_refused_without_debit() {
    let fx = fixture(MemoryAccountStore::new(), &[("alice", 0, None)]).await;
    write_script(&fx.scripts(), "alice", "hello", "#!/bin/sh\necho hi\n", None);

    let err = fx.orchestrator.execute(request("alice", "hello")).await.unwrap_err();
    assert!(matches!(err, ExecError::FailedPrecondition(_)), "{err:?}");
    assert_eq!(fx.ledger.balance("alice").await.unwrap(), 0);
}

#[tokio::test]
async fn ungranted_withdrawal_is_a_permission_error() {
    let fx = fixture(
        MemoryAccountStore::new(),
        &[("alice", 1000, None), ("bob", 1000, Some("k"))],
    )
    .await;
    write_script(
        &fx.scripts(),
        "alice",
        "tip",
        "#!/bin/sh\n",
        Some(r#"{"capabilities": {"withdrawal_limit": 10}}"#),
    );

    let mut req = request("alice", "tip");
    req.executing_account = "bob".into();
    req.credential = Some("k".into());
    let err = fx.orchestrator.execute(req).await.unwrap_err();
    assert!(matches!(err, ExecError::PermissionDenied(_)), "{err:?}");
    assert_eq!(fx.ledger.balance("alice").await.unwrap(), 1000);
    assert_eq!(fx.ledger.balance("bob").await.unwrap(), 1000);
}

#[tokio::test]
async fn overrunning_the_deadline_sets_the_flag() {
    let accounts = MemoryAccountStore::new().with_profile(
        "alice",
        AccountProfile {
            traits: AccountTraits {
                time_limit_seconds: 1,
                ..AccountTraits::default()
            },
            ..AccountProfile::default()
        },
    );
    let fx = fixture(accounts, &[("alice", 100_000, None)]).await;
    write_script(&fx.scripts(), "alice", "forever", "#!/bin/sh\nsleep 30\n", None);

    let started = std::time::Instant::now();
    let result = fx.orchestrator.execute(request("alice", "forever")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.time_limit_exceeded);
    assert!(!result.status.success());
    // Still billed for the second it used.
    assert!(result.cost >= 1000, "cost {}", result.cost);
    assert_eq!(fx.ledger.balance("alice").await.unwrap(), 100_000 - result.cost);
}

#[tokio::test]
async fn traversal_is_an_invalid_argument() {
    let fx = fixture(MemoryAccountStore::new(), &[("alice", 1000, None)]).await;
    let err = fx
        .orchestrator
        .execute(request("alice", "../../etc/passwd"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecError::InvalidArgument(_)), "{err:?}");

    let err = fx.orchestrator.execute(request("alice", "ghost")).await.unwrap_err();
    assert!(matches!(err, ExecError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn script_reaches_services_over_the_control_channel() {
    let fx = fixture(MemoryAccountStore::new(), &[("alice", 1000, None)]).await;
    let body = r#"#!/bin/sh
printf '%s\n' '{"id":7,"method":"Output.SetPrivate","params":[{"private":true}]}' >&3
read -r reply <&3
echo "$reply"
printf '%s\n' '{"id":8,"method":"Context.Get","params":[{}]}' >&3
read -r reply <&3
echo "$reply"
"#;
    write_script(&fx.scripts(), "alice", "talk", body, None);

    let mut req = request("alice", "talk");
    req.context = json!({"channel": "c-42"});
    let result = fx.orchestrator.execute(req).await.unwrap();
    assert!(result.status.success(), "{:?}", String::from_utf8_lossy(&result.stderr));

    let stdout = String::from_utf8(result.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines[0]["id"], json!(7));
    assert_eq!(lines[0]["error"], serde_json::Value::Null);
    assert_eq!(lines[1]["id"], json!(8));
    assert_eq!(lines[1]["result"], json!({"channel": "c-42"}));
    assert!(result.report.output.private);
}

#[tokio::test]
async fn charges_are_capped_and_reported() {
    let accounts = MemoryAccountStore::new()
        .with_profile(
            "alice",
            AccountProfile {
                traits: AccountTraits {
                    allowed_services: ["Money".to_string()].into_iter().collect(),
                    ..AccountTraits::default()
                },
                ..AccountProfile::default()
            },
        )
        .with_profile(
            "bob",
            AccountProfile {
                capabilities: Capabilities {
                    withdrawal_limit: 100,
                    ..Capabilities::default()
                },
                ..AccountProfile::default()
            },
        );
    let fx = fixture(
        accounts,
        &[("alice", 10_000, None), ("bob", 1000, Some("k")), ("shop", 0, None)],
    )
    .await;
    let shop = encode_handle("shop");
    let body = format!(
        r#"#!/bin/sh
printf '%s\n' '{{"id":1,"method":"Money.Charge","params":[{{"targetAccountHandle":"{shop}","amount":30}}]}}' >&3
read -r reply <&3
echo "$reply"
printf '%s\n' '{{"id":2,"method":"Money.Charge","params":[{{"targetAccountHandle":"{shop}","amount":30}}]}}' >&3
read -r reply <&3
echo "$reply"
"#
    );
    write_script(
        &fx.scripts(),
        "alice",
        "shopping",
        &body,
        Some(r#"{"capabilities": {"withdrawal_limit": 50}}"#),
    );

    let mut req = request("alice", "shopping");
    req.executing_account = "bob".into();

    // Touching bob's funds needs bob's key.
    let err = fx.orchestrator.execute(req.clone()).await.unwrap_err();
    assert!(matches!(err, ExecError::PermissionDenied(_)), "{err:?}");

    req.credential = Some("k".into());
    let result = fx.orchestrator.execute(req).await.unwrap();
    let stdout = String::from_utf8(result.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines[0]["error"], serde_json::Value::Null);
    assert!(lines[1]["error"].as_str().unwrap().contains("withdrawal limit"));

    assert_eq!(result.report.withdrawals.len(), 1);
    assert_eq!(result.report.withdrawals[0].amount, 30);
    assert_eq!(result.report.withdrawals[0].target, "shop");
    assert_eq!(fx.ledger.balance("bob").await.unwrap(), 970);
    assert_eq!(fx.ledger.balance("shop").await.unwrap(), 30);
    assert_eq!(result.billed_account, "alice");
}
