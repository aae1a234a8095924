//! Starting a script under a restricted-execution tool.
//!
//! The launcher allocates the control socket pair, starts serving the host
//! end, starts the tool with the peer end at a fixed descriptor, and then
//! races the process against its deadline. On expiry the process group is
//! killed and the real exit is still awaited so timings stay accurate.

use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio as ProcessStdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abi;
use crate::accounts::AccountTraits;
use crate::process::{ExitStatus, ProcessGroup, Rusage};
use crate::rpc::{self, codec, Handler};
use crate::scripts::Script;
use crate::supervisor::{WorkerRequest, WorkerResult};

/// Default cap on captured stdout and stderr, each.
pub const DEFAULT_OUTPUT_LIMIT: usize = 5 * 1024 * 1024;

const STATUS_LIMIT: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("control socket: {0}")]
    Socket(#[source] io::Error),

    #[error("start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("wait: {0}")]
    Wait(#[source] io::Error),

    #[error("encode worker request: {0}")]
    Encode(String),

    #[error("supervisor exited without a result")]
    NoResult,

    #[error("bad supervisor result: {0}")]
    BadResult(String),

    #[error("task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tool {
    /// External nsjail binary.
    Nsjail(NsjailConfig),
    /// This binary re-executed as `supervise`.
    Supervisor(SupervisorConfig),
    /// No isolation at all. Development and tests only.
    Unconfined,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NsjailConfig {
    #[serde(default = "default_nsjail")]
    pub path: PathBuf,
    pub chroot: PathBuf,
    #[serde(default = "default_cgroup_parent")]
    pub cgroup_mem_parent: String,
    #[serde(default = "default_cgroup_parent")]
    pub cgroup_pids_parent: String,
    /// Kafel policy text.
    #[serde(default)]
    pub seccomp_policy: Option<String>,
    /// Address space limit, MiB.
    #[serde(default = "default_rlimit_as")]
    pub rlimit_as_mb: u64,
    #[serde(default)]
    pub macvlan: Option<MacvlanConfig>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MacvlanConfig {
    pub interface: String,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Defaults to the running executable.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    pub chroot: PathBuf,
    #[serde(default = "default_staging")]
    pub staging: PathBuf,
    #[serde(default)]
    pub cgroup_parent: Option<PathBuf>,
    #[serde(default = "crate::seccomp::default_denied")]
    pub denied_syscalls: Vec<String>,
}

fn default_nsjail() -> PathBuf {
    PathBuf::from("/usr/bin/nsjail")
}

fn default_cgroup_parent() -> String {
    "/".to_string()
}

fn default_rlimit_as() -> u64 {
    1024
}

fn default_staging() -> PathBuf {
    PathBuf::from("/run/meterbox")
}

#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub tool: Tool,
    /// Host directory mounted read-only at the support library path.
    pub library: PathBuf,
    pub output_limit: usize,
}

/// Where the script's standard streams go.
pub enum Stdio {
    /// Feed `input` and capture output up to the configured cap.
    Capture { input: Vec<u8> },
    /// Use descriptors supplied by the caller.
    Attach {
        stdin: OwnedFd,
        stdout: OwnedFd,
        stderr: OwnedFd,
    },
}

/// Everything needed to start one script.
pub struct LaunchSpec {
    pub script: Script,
    pub scripts_root: PathBuf,
    /// Host directory of the owner's persistent storage.
    pub storage: PathBuf,
    pub context: Value,
    pub traits: AccountTraits,
    /// Effective memory ceiling, bytes.
    pub memory_limit: u64,
    pub deadline: Duration,
    pub stdio: Stdio,
}

/// Terminal result of a launch.
#[derive(Debug, Clone, Default)]
pub struct LaunchOutcome {
    pub status: ExitStatus,
    pub time_limit_exceeded: bool,
    pub real_time: Duration,
    pub rusage: Rusage,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub struct Launcher {
    settings: LauncherSettings,
}

/// A started process with its control server.
pub struct Running {
    group: ProcessGroup,
    started: Instant,
    deadline: Duration,
    nsjail: bool,
    waiter: JoinHandle<io::Result<(i32, Rusage)>>,
    server: Option<JoinHandle<()>>,
    stdout: Option<JoinHandle<io::Result<Vec<u8>>>>,
    stderr: Option<JoinHandle<io::Result<Vec<u8>>>>,
    status: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

/// Descriptors the child needs at fixed numbers.
struct Placement {
    moved: Vec<(OwnedFd, RawFd)>,
}

impl Placement {
    fn new() -> Self {
        Self { moved: Vec::new() }
    }

    /// Put `fd` at `target` in the child.
    fn place(&mut self, fd: impl AsFd, target: RawFd) -> io::Result<()> {
        // Park the source above every target so no dup2 clobbers another source.
        let parked = unsafe { libc::fcntl(fd.as_fd().as_raw_fd(), libc::F_DUPFD_CLOEXEC, 64) };
        if parked < 0 {
            return Err(io::Error::last_os_error());
        }
        self.moved
            .push((unsafe { OwnedFd::from_raw_fd(parked) }, target));
        Ok(())
    }

    fn install(&self, cmd: &mut Command) {
        let pairs: Vec<(RawFd, RawFd)> = self
            .moved
            .iter()
            .map(|(fd, target)| (fd.as_raw_fd(), *target))
            .collect();
        unsafe {
            cmd.pre_exec(move || {
                for (source, target) in &pairs {
                    if libc::dup2(*source, *target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }
}

impl Launcher {
    pub fn new(settings: LauncherSettings) -> Self {
        Self { settings }
    }

    pub fn tool(&self) -> &Tool {
        &self.settings.tool
    }

    /// Start `spec` and wait for its terminal result.
    pub async fn run(&self, spec: LaunchSpec, handler: Arc<dyn Handler>) -> Result<LaunchOutcome, LaunchError> {
        self.spawn(spec, handler)?.wait().await
    }

    /// Start `spec` with `handler` answering its control channel.
    ///
    /// The handler is serving before the process exists.
    pub fn spawn(&self, spec: LaunchSpec, handler: Arc<dyn Handler>) -> Result<Running, LaunchError> {
        let (host, peer) = codec::pair().map_err(LaunchError::Socket)?;
        let server = tokio::spawn(async move {
            if let Err(err) = rpc::serve(host, handler).await {
                warn!(error = %err, "control channel failed");
            }
        });

        match self.start(spec, peer) {
            Ok(mut running) => {
                running.server = Some(server);
                Ok(running)
            }
            Err(err) => {
                server.abort();
                Err(err)
            }
        }
    }

    fn start(&self, spec: LaunchSpec, control: OwnedFd) -> Result<Running, LaunchError> {
        match &self.settings.tool {
            Tool::Nsjail(config) => {
                let args = nsjail_args(config, &self.settings.library, &spec);
                let mut cmd = Command::new(&config.path);
                cmd.args(&args);
                self.start_direct(cmd, spec, control, true)
            }
            Tool::Unconfined => {
                let mut cmd = Command::new(abi::SHELL);
                cmd.arg("-c")
                    .arg(abi::SHELL_EXEC)
                    .arg(&spec.script.path)
                    .current_dir(&spec.storage)
                    .env_clear()
                    .env("PATH", "/usr/local/bin:/usr/bin:/bin")
                    .env("HOME", &spec.storage)
                    .env(abi::CONTEXT_ENV, spec.context.to_string());
                self.start_direct(cmd, spec, control, false)
            }
            Tool::Supervisor(config) => self.start_supervised(config, spec, control),
        }
    }

    /// Tools that take the script's stdio directly, control at 3, log at 4.
    fn start_direct(
        &self,
        mut cmd: Command,
        spec: LaunchSpec,
        control: OwnedFd,
        nsjail: bool,
    ) -> Result<Running, LaunchError> {
        let program = format!("{:?}", cmd.get_program());
        let spawn_err = |source| LaunchError::Spawn {
            program: program.clone(),
            source,
        };

        let mut placement = Placement::new();
        placement.place(&control, abi::CONTROL_FD).map_err(spawn_err)?;
        placement
            .place(io::stderr().as_fd(), abi::LOG_FD)
            .map_err(spawn_err)?;
        placement.install(&mut cmd);

        let mut input = None;
        match spec.stdio {
            Stdio::Capture { input: bytes } => {
                cmd.stdin(ProcessStdio::piped())
                    .stdout(ProcessStdio::piped())
                    .stderr(ProcessStdio::piped());
                input = Some(bytes);
            }
            Stdio::Attach { stdin, stdout, stderr } => {
                cmd.stdin(ProcessStdio::from(stdin))
                    .stdout(ProcessStdio::from(stdout))
                    .stderr(ProcessStdio::from(stderr));
            }
        }
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(spawn_err)?;
        // The child has its copies now.
        drop(placement);
        drop(control);
        drop(cmd);

        let pid = child.id() as libc::pid_t;
        info!(pid, program = %program, script = %spec.script.name, "sandbox started");

        let limit = self.settings.output_limit;
        let stdout = child.stdout.take().map(|out| capture(OwnedFd::from(out), limit));
        let stderr = child.stderr.take().map(|err| capture(OwnedFd::from(err), limit));
        if let (Some(stdin), Some(bytes)) = (child.stdin.take(), input) {
            feed(OwnedFd::from(stdin), bytes);
        }

        let group = ProcessGroup::new(pid);
        Ok(Running {
            group: group.clone(),
            started: Instant::now(),
            deadline: spec.deadline,
            nsjail,
            waiter: tokio::task::spawn_blocking(move || group.reap()),
            server: None,
            stdout,
            stderr,
            status: None,
        })
    }

    /// Re-exec ourselves as `supervise` with the fixed descriptor layout.
    fn start_supervised(
        &self,
        config: &SupervisorConfig,
        spec: LaunchSpec,
        control: OwnedFd,
    ) -> Result<Running, LaunchError> {
        let executable = match &config.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|source| LaunchError::Spawn {
                program: "current executable".into(),
                source,
            })?,
        };
        let program = executable.display().to_string();
        let spawn_err = |source| LaunchError::Spawn {
            program: program.clone(),
            source,
        };

        let request = WorkerRequest {
            owner: spec.script.owner.clone(),
            name: spec.script.name.clone(),
            context: spec.context.to_string(),
            traits: spec.traits.clone(),
            memory_limit: spec.memory_limit,
            deadline_ms: spec.deadline.as_millis() as u64,
            chroot: config.chroot.clone(),
            staging: config.staging.clone(),
            storage: spec.storage.clone(),
            scripts_root: spec.scripts_root.clone(),
            library: self.settings.library.clone(),
            cgroup_parent: config.cgroup_parent.clone(),
            denied_syscalls: config.denied_syscalls.clone(),
        };
        let encoded =
            rmp_serde::to_vec_named(&request).map_err(|e| LaunchError::Encode(e.to_string()))?;

        let (request_read, request_write) = pipe().map_err(spawn_err)?;
        let (status_read, status_write) = pipe().map_err(spawn_err)?;

        let mut placement = Placement::new();
        let mut input = None;
        let mut stdout = None;
        let mut stderr = None;
        match spec.stdio {
            Stdio::Capture { input: bytes } => {
                let (in_read, in_write) = pipe().map_err(spawn_err)?;
                let (out_read, out_write) = pipe().map_err(spawn_err)?;
                let (err_read, err_write) = pipe().map_err(spawn_err)?;
                placement.place(&in_read, abi::supervise::STDIN_FD).map_err(spawn_err)?;
                placement.place(&out_write, abi::supervise::STDOUT_FD).map_err(spawn_err)?;
                placement.place(&err_write, abi::supervise::STDERR_FD).map_err(spawn_err)?;
                input = Some((in_write, bytes));
                stdout = Some(out_read);
                stderr = Some(err_read);
            }
            Stdio::Attach {
                stdin,
                stdout: out,
                stderr: err,
            } => {
                placement.place(&stdin, abi::supervise::STDIN_FD).map_err(spawn_err)?;
                placement.place(&out, abi::supervise::STDOUT_FD).map_err(spawn_err)?;
                placement.place(&err, abi::supervise::STDERR_FD).map_err(spawn_err)?;
            }
        }
        placement
            .place(&status_write, abi::supervise::STATUS_FD)
            .map_err(spawn_err)?;
        placement
            .place(&request_read, abi::supervise::REQUEST_FD)
            .map_err(spawn_err)?;
        placement
            .place(&control, abi::supervise::CONTROL_FD)
            .map_err(spawn_err)?;

        let mut cmd = Command::new(&executable);
        cmd.arg("supervise")
            .stdin(ProcessStdio::null())
            .stdout(ProcessStdio::null())
            .stderr(ProcessStdio::inherit())
            .process_group(0);
        placement.install(&mut cmd);

        let child = cmd.spawn().map_err(spawn_err)?;
        drop(placement);
        drop((control, status_write, request_read));
        drop(cmd);

        let pid = child.id() as libc::pid_t;
        info!(pid, owner = %request.owner, script = %request.name, "supervisor started");

        tokio::task::spawn_blocking(move || {
            let mut file = File::from(request_write);
            if let Err(err) = file.write_all(&encoded) {
                warn!(error = %err, "worker request not delivered");
            }
        });

        let limit = self.settings.output_limit;
        if let Some((in_write, bytes)) = input {
            feed(in_write, bytes);
        }

        let group = ProcessGroup::new(pid);
        Ok(Running {
            group: group.clone(),
            started: Instant::now(),
            deadline: spec.deadline,
            nsjail: false,
            waiter: tokio::task::spawn_blocking(move || group.reap()),
            server: None,
            stdout: stdout.map(|fd| capture(fd, limit)),
            stderr: stderr.map(|fd| capture(fd, limit)),
            status: Some(capture_status(status_read)),
        })
    }
}

impl Running {
    pub fn pid(&self) -> libc::pid_t {
        self.group.pid()
    }

    /// Handle for signalling the process group until it is reaped.
    pub fn group(&self) -> ProcessGroup {
        self.group.clone()
    }

    /// Wait for exit or the deadline, whichever comes first.
    pub async fn wait(self) -> Result<LaunchOutcome, LaunchError> {
        let Running {
            group,
            started,
            deadline,
            nsjail,
            mut waiter,
            server,
            stdout,
            stderr,
            status,
        } = self;
        let pid = group.pid();

        let expiry = tokio::time::sleep_until((started + deadline).into());
        tokio::pin!(expiry);

        let (reaped, time_limit_exceeded) = tokio::select! {
            reaped = &mut waiter => (reaped, false),
            _ = &mut expiry => {
                warn!(pid, ?deadline, "deadline exceeded, killing");
                if let Err(err) = group.signal(libc::SIGKILL) {
                    warn!(pid, error = %err, "kill failed");
                }
                ((&mut waiter).await, true)
            }
        };
        let real_time = started.elapsed();
        let reaped = reaped.map_err(LaunchError::Join).and_then(|r| r.map_err(LaunchError::Wait));

        // The reap already killed whatever was left of the group.
        if let Some(server) = server {
            server.abort();
        }

        let (raw, rusage) = reaped?;
        let stdout = collect(stdout).await;
        let stderr = collect(stderr).await;

        let mut outcome = LaunchOutcome {
            status: if nsjail {
                ExitStatus::from_nsjail(raw)
            } else {
                ExitStatus::from_raw(raw)
            },
            time_limit_exceeded,
            real_time,
            rusage,
            stdout,
            stderr,
        };

        if let Some(status) = status {
            let bytes = status.await?.map_err(LaunchError::Wait)?;
            if bytes.is_empty() {
                warn!(pid, status = ?outcome.status, "supervisor produced no result");
                return Err(LaunchError::NoResult);
            }
            let result: WorkerResult =
                rmp_serde::from_slice(&bytes).map_err(|e| LaunchError::BadResult(e.to_string()))?;
            outcome.status = result.status;
            outcome.time_limit_exceeded |= result.time_limit_exceeded;
            outcome.rusage.user = Duration::from_millis(result.user_time_ms);
            outcome.rusage.system = Duration::from_millis(result.system_time_ms);
            debug!(pid, inner_real_ms = result.real_time_ms, "supervisor result");
        }

        debug!(pid, status = ?outcome.status, tle = outcome.time_limit_exceeded,
               real_ms = outcome.real_time.as_millis() as u64, "sandbox finished");
        Ok(outcome)
    }
}

async fn collect(task: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Vec<u8> {
    match task {
        Some(task) => match task.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                warn!(error = %err, "output capture failed");
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "output capture task failed");
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(io::Error::from)
}

/// Read up to `limit` bytes, then drain and drop the rest.
fn capture(fd: OwnedFd, limit: usize) -> JoinHandle<io::Result<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        let mut file = File::from(fd);
        let mut kept = Vec::new();
        (&mut file).take(limit as u64).read_to_end(&mut kept)?;
        io::copy(&mut file, &mut io::sink())?;
        Ok(kept)
    })
}

fn capture_status(fd: OwnedFd) -> JoinHandle<io::Result<Vec<u8>>> {
    tokio::task::spawn_blocking(move || {
        let mut bytes = Vec::new();
        File::from(fd).take(STATUS_LIMIT).read_to_end(&mut bytes)?;
        Ok(bytes)
    })
}

fn feed(fd: OwnedFd, input: Vec<u8>) {
    tokio::task::spawn_blocking(move || {
        let mut file = File::from(fd);
        match file.write_all(&input) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Err(err) => warn!(error = %err, "stdin write failed"),
        }
    });
}

/// Command line for nsjail.
pub fn nsjail_args(config: &NsjailConfig, library: &Path, spec: &LaunchSpec) -> Vec<String> {
    let seconds = spec.deadline.as_secs() + u64::from(spec.deadline.subsec_nanos() > 0);
    let seconds = seconds.max(1);

    let mut args: Vec<String> = [
        "--mode", "o",
        "--log_fd", "4",
        "--pass_fd", "3",
        "--user", "nobody",
        "--group", "nogroup",
        "--hostname", "sandbox",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    flag(&mut args, "--cgroup_mem_max", spec.memory_limit);
    flag(&mut args, "--cgroup_mem_parent", &config.cgroup_mem_parent);
    flag(&mut args, "--cgroup_pids_max", spec.traits.process_limit);
    flag(&mut args, "--cgroup_pids_parent", &config.cgroup_pids_parent);
    flag(&mut args, "--rlimit_as", config.rlimit_as_mb);
    flag(&mut args, "--rlimit_cpu", seconds);
    flag(&mut args, "--rlimit_nofile", spec.traits.open_file_limit);
    flag(&mut args, "--time_limit", seconds);
    flag(&mut args, "--chroot", config.chroot.display());
    if spec.traits.tmpfs_size > 0 {
        flag(&mut args, "--tmpfsmount", "/tmp");
        flag(&mut args, "--tmpfs_size", spec.traits.tmpfs_size);
    }
    if let Some(policy) = &config.seccomp_policy {
        flag(&mut args, "--seccomp_string", policy);
    }
    if spec.traits.allow_network_access {
        match &config.macvlan {
            Some(macvlan) => {
                flag(&mut args, "--macvlan_iface", &macvlan.interface);
                flag(&mut args, "--macvlan_vs_ip", &macvlan.ip);
                flag(&mut args, "--macvlan_vs_nm", &macvlan.netmask);
                flag(&mut args, "--macvlan_vs_gw", &macvlan.gateway);
            }
            None => args.push("--disable_clone_newnet".to_string()),
        }
    }

    flag(
        &mut args,
        "--bindmount",
        format!("{}:{}", spec.storage.display(), abi::STORAGE_MOUNT),
    );
    flag(
        &mut args,
        "--bindmount_ro",
        format!("{}:{}", spec.scripts_root.display(), abi::SCRIPTS_MOUNT),
    );
    flag(
        &mut args,
        "--bindmount_ro",
        format!("{}:{}", library.display(), abi::LIBRARY_MOUNT),
    );
    flag(&mut args, "--cwd", abi::STORAGE_MOUNT);
    flag(&mut args, "--env", format!("{}={}", abi::CONTEXT_ENV, spec.context));
    flag(&mut args, "--env", "PATH=/usr/local/bin:/usr/bin:/bin");
    flag(&mut args, "--env", format!("HOME={}", abi::STORAGE_MOUNT));

    args.extend(config.extra_args.iter().cloned());
    args.extend([
        "--".to_string(),
        abi::SHELL.to_string(),
        "-c".to_string(),
        abi::SHELL_EXEC.to_string(),
        sandbox_script_path(&spec.script),
    ]);
    args
}

fn flag(args: &mut Vec<String>, name: &str, value: impl std::fmt::Display) {
    args.push(name.to_string());
    args.push(value.to_string());
}

/// Path of a script as seen from inside the sandbox.
pub fn sandbox_script_path(script: &Script) -> String {
    format!("{}/{}/{}", abi::SCRIPTS_MOUNT, script.owner, script.name)
}
