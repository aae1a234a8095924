//! `Supervisor`: lets a script start another script and wait for it.
//!
//! `Spawn` takes exactly three descriptors with the request (the child's
//! stdin, stdout and stderr). The child shares the parent's storage and
//! traits, runs no longer than what is left of the parent's deadline and
//! can only reach the `Context` service.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use super::{unknown_method, Registry, ServiceKind};
use crate::accounts::AccountTraits;
use crate::launcher::{LaunchError, LaunchOutcome, LaunchSpec, Launcher, Stdio};
use crate::process::ProcessGroup;
use crate::rpc::{Call, CallError, Reply};
use crate::scripts::{ScriptStore, Visibility};

/// What a spawned script inherits from the script that spawned it.
pub struct Spawner {
    pub launcher: Arc<Launcher>,
    pub scripts: Arc<dyn ScriptStore>,
    /// Owner of the spawning script.
    pub owner: String,
    pub storage: PathBuf,
    pub traits: AccountTraits,
    pub memory_limit: u64,
    /// Absolute deadline of the spawning script.
    pub deadline: Instant,
    pub context: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpawnRequest {
    owner_name: String,
    name: String,
}

#[derive(Deserialize)]
struct HandleRequest {
    handle: String,
}

#[derive(Deserialize)]
struct SignalRequest {
    handle: String,
    signal: i32,
}

struct Child {
    group: ProcessGroup,
    task: Option<JoinHandle<Result<LaunchOutcome, LaunchError>>>,
}

pub struct SupervisorService {
    spawner: Spawner,
    children: Mutex<HashMap<String, Child>>,
}

impl SupervisorService {
    pub fn new(spawner: Spawner) -> Self {
        Self {
            spawner,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) async fn call(&self, method: &str, call: Call) -> Result<Reply, CallError> {
        match method {
            "Spawn" => self.spawn(call).await,
            "Wait" => self.wait(call.params()?).await,
            "Signal" => self.signal(call.params()?),
            other => Err(unknown_method(ServiceKind::Supervisor, other)),
        }
    }

    async fn spawn(&self, call: Call) -> Result<Reply, CallError> {
        let req: SpawnRequest = call.params()?;
        let fds: Result<[OwnedFd; 3], _> = call.fds.try_into();
        let Ok([stdin, stdout, stderr]) = fds else {
            return Err(CallError::new("Spawn needs exactly 3 descriptors: stdin, stdout, stderr"));
        };

        let script = self
            .spawner
            .scripts
            .open(&req.owner_name, &req.name)
            .await
            .map_err(|err| CallError::new(err.to_string()))?;
        if script.meta.visibility != Visibility::Public && script.owner != self.spawner.owner {
            return Err(CallError::new(format!(
                "{}/{} is not published",
                script.owner, script.name
            )));
        }

        let deadline = self.spawner.deadline.saturating_duration_since(Instant::now());
        if deadline.is_zero() {
            return Err(CallError::new("no time left to spawn"));
        }

        let spec = LaunchSpec {
            scripts_root: self.spawner.scripts.root().to_path_buf(),
            storage: self.spawner.storage.clone(),
            context: self.spawner.context.clone(),
            traits: self.spawner.traits.clone(),
            memory_limit: self.spawner.memory_limit,
            deadline,
            stdio: Stdio::Attach {
                stdin,
                stdout,
                stderr,
            },
            script,
        };
        let handler = Arc::new(Registry::context_only(self.spawner.context.clone()));
        let running = self.spawner.launcher.spawn(spec, handler).map_err(|err| {
            warn!(error = %err, "child script did not start");
            CallError::new("child script did not start")
        })?;

        let group = running.group();
        let pid = group.pid();
        let handle = Uuid::new_v4().simple().to_string();
        let task = tokio::spawn(running.wait());
        self.children().insert(
            handle.clone(),
            Child {
                group,
                task: Some(task),
            },
        );
        info!(pid, %handle, owner = %req.owner_name, script = %req.name, "child script spawned");
        Reply::json(json!({ "handle": handle }))
    }

    async fn wait(&self, req: HandleRequest) -> Result<Reply, CallError> {
        let task = {
            let mut children = self.children();
            let child = children
                .get_mut(&req.handle)
                .ok_or_else(|| CallError::new("unknown handle"))?;
            child
                .task
                .take()
                .ok_or_else(|| CallError::new("already being waited on"))?
        };

        let outcome = task.await;
        self.children().remove(&req.handle);
        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(error = %err, "child script failed");
                return Err(CallError::new("child script failed"));
            }
            Err(err) => {
                warn!(error = %err, "child wait task failed");
                return Err(CallError::new("child script failed"));
            }
        };
        Reply::json(json!({
            "waitStatus": outcome.status,
            "timeLimitExceeded": outcome.time_limit_exceeded,
        }))
    }

    fn signal(&self, req: SignalRequest) -> Result<Reply, CallError> {
        if !(1..=31).contains(&req.signal) {
            return Err(CallError::new(format!("invalid signal {}", req.signal)));
        }
        let children = self.children();
        let child = children
            .get(&req.handle)
            .ok_or_else(|| CallError::new("unknown handle"))?;
        // A child already reaped, possibly under a concurrent Wait, is left alone.
        child
            .group
            .signal(req.signal)
            .map_err(|err| CallError::new(format!("signal failed: {err}")))?;
        Ok(Reply::empty())
    }
}

impl Drop for SupervisorService {
    fn drop(&mut self) {
        for (handle, child) in self.children().drain() {
            if let Err(err) = child.group.signal(libc::SIGKILL) {
                warn!(%handle, error = %err, "orphaned child not killed");
            }
            if let Some(task) = child.task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LauncherSettings, Tool, DEFAULT_OUTPUT_LIMIT};
    use crate::scripts::FsScriptStore;
    use std::io::Read;
    use std::time::Duration;

    fn spawner(root: &std::path::Path, storage: &std::path::Path, deadline: Duration) -> Spawner {
        Spawner {
            launcher: Arc::new(Launcher::new(LauncherSettings {
                tool: Tool::Unconfined,
                library: PathBuf::from("/nonexistent"),
                output_limit: DEFAULT_OUTPUT_LIMIT,
            })),
            scripts: Arc::new(FsScriptStore::new(root)),
            owner: "alice".into(),
            storage: storage.to_path_buf(),
            traits: AccountTraits::default(),
            memory_limit: 64 << 20,
            deadline: Instant::now() + deadline,
            context: json!({}),
        }
    }

    fn write_script(root: &std::path::Path, owner: &str, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let dir = root.join(owner);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn pipe() -> (OwnedFd, OwnedFd) {
        nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap()
    }

    fn spawn_call(owner: &str, name: &str, fds: Vec<OwnedFd>) -> Call {
        Call {
            method: "Supervisor.Spawn".into(),
            params: json!({"ownerName": owner, "name": name}),
            fds,
        }
    }

    fn plain(method: &str, params: Value) -> Call {
        Call {
            method: method.into(),
            params,
            fds: Vec::new(),
        }
    }

    #[tokio::test]
    async fn spawns_and_waits_for_a_child() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        write_script(&root, "alice", "child", "#!/bin/sh\necho from-child\nexit 3\n");
        let service = SupervisorService::new(spawner(&root, dir.path(), Duration::from_secs(10)));

        let (in_read, in_write) = pipe();
        let (out_read, out_write) = pipe();
        let (_err_read, err_write) = pipe();
        drop(in_write);
        let reply = service
            .call("Spawn", spawn_call("alice", "child", vec![in_read, out_write, err_write]))
            .await
            .unwrap();
        let handle = reply.body["handle"].as_str().unwrap().to_string();

        let waited = service
            .call("Wait", plain("Supervisor.Wait", json!({"handle": handle})))
            .await
            .unwrap();
        assert_eq!(waited.body["waitStatus"]["exit_code"], json!(3));
        assert_eq!(waited.body["timeLimitExceeded"], json!(false));

        let mut output = String::new();
        std::fs::File::from(out_read).read_to_string(&mut output).unwrap();
        assert_eq!(output, "from-child\n");

        // A handle can be waited on once.
        assert!(service
            .call("Wait", plain("Supervisor.Wait", json!({"handle": handle})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn needs_three_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let service = SupervisorService::new(spawner(dir.path(), dir.path(), Duration::from_secs(10)));
        let (a, b) = pipe();
        let err = service
            .call("Spawn", spawn_call("alice", "child", vec![a, b]))
            .await
            .unwrap_err();
        assert!(err.0.contains("exactly 3"));
    }

    #[tokio::test]
    async fn private_scripts_of_others_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        write_script(&root, "bob", "secret", "#!/bin/sh\n");
        let service = SupervisorService::new(spawner(&root, dir.path(), Duration::from_secs(10)));
        let (a, b) = pipe();
        let (c, _d) = pipe();
        let err = service
            .call("Spawn", spawn_call("bob", "secret", vec![a, b, c]))
            .await
            .unwrap_err();
        assert!(err.0.contains("not published"));
    }

    #[tokio::test]
    async fn signal_kills_a_running_child() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        write_script(&root, "alice", "sleepy", "#!/bin/sh\nsleep 30\n");
        let service = SupervisorService::new(spawner(&root, dir.path(), Duration::from_secs(20)));

        let (in_read, _in_write) = pipe();
        let (_out_read, out_write) = pipe();
        let (_err_read, err_write) = pipe();
        let reply = service
            .call("Spawn", spawn_call("alice", "sleepy", vec![in_read, out_write, err_write]))
            .await
            .unwrap();
        let handle = reply.body["handle"].as_str().unwrap().to_string();

        service
            .call(
                "Signal",
                plain("Supervisor.Signal", json!({"handle": handle, "signal": libc::SIGKILL})),
            )
            .await
            .unwrap();
        let waited = service
            .call("Wait", plain("Supervisor.Wait", json!({"handle": handle})))
            .await
            .unwrap();
        assert_eq!(waited.body["waitStatus"]["signal"], json!(libc::SIGKILL));
    }

    #[tokio::test]
    async fn signalling_a_reaped_child_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("scripts");
        write_script(&root, "alice", "quick", "#!/bin/sh
exit 0
");
        let service = SupervisorService::new(spawner(&root, dir.path(), Duration::from_secs(10)));

        let (in_read, _in_write) = pipe();
        let (_out_read, out_write) = pipe();
        let (_err_read, err_write) = pipe();
        let reply = service
            .call("Spawn", spawn_call("alice", "quick", vec![in_read, out_write, err_write]))
            .await
            .unwrap();
        let handle = reply.body["handle"].as_str().unwrap().to_string();

        // The reaper runs from spawn on, so the child is gone well before this.
        tokio::time::sleep(Duration::from_millis(500)).await;
        service
            .call(
                "Signal",
                plain("Supervisor.Signal", json!({"handle": handle, "signal": libc::SIGKILL})),
            )
            .await
            .unwrap();

        let waited = service
            .call("Wait", plain("Supervisor.Wait", json!({"handle": handle})))
            .await
            .unwrap();
        assert_eq!(waited.body["waitStatus"]["exit_code"], json!(0));
        assert_eq!(waited.body["waitStatus"]["signal"], Value::Null);
    }
}
