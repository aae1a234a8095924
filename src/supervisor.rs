//! `meterbox supervise`: the first process of a sandbox.
//!
//! The launcher re-executes this binary with a fixed descriptor layout
//! (see [`crate::abi::supervise`]). The supervisor reads its request,
//! validates it, applies limits, builds the container, waits for the script
//! with its own deadline backstop and writes a result record.
//!
//! Failures before the script is running abort without a result; the
//! launcher reports that as an internal error. After that point a result is
//! always attempted.

use nix::sched::CloneFlags;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::abi::{self, supervise};
use crate::accounts::AccountTraits;
use crate::cgroup::{Cgroup, CgroupLimits};
use crate::error::ExecError;
use crate::process::{wait_rusage, ExitStatus, Rusage};
use crate::sandbox::{
    ContainerConfig, ContainerFactory, MountKind, MountSpec, NamespaceFactory, ProcessSpec,
    SandboxError,
};
use crate::scripts;

/// Address space ceiling. Memory proper is bounded by the cgroup.
const ADDRESS_SPACE_LIMIT: u64 = 1 << 30;
const STACK_LIMIT: u64 = 8 << 20;
const FILE_SIZE_LIMIT: u64 = 256 << 20;

/// Configuration handed to the supervisor on [`supervise::REQUEST_FD`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub owner: String,
    pub name: String,
    /// Serialized JSON context.
    pub context: String,
    pub traits: AccountTraits,
    pub memory_limit: u64,
    pub deadline_ms: u64,
    pub chroot: PathBuf,
    pub staging: PathBuf,
    pub storage: PathBuf,
    pub scripts_root: PathBuf,
    pub library: PathBuf,
    pub cgroup_parent: Option<PathBuf>,
    pub denied_syscalls: Vec<String>,
}

/// Written to [`supervise::STATUS_FD`] once the script is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: ExitStatus,
    pub time_limit_exceeded: bool,
    pub real_time_ms: u64,
    pub user_time_ms: u64,
    pub system_time_ms: u64,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("read request: {0}")]
    Request(#[from] rmp_serde::decode::Error),

    #[error("invalid request: {0}")]
    Invalid(#[from] ExecError),

    #[error("{what}: {source}")]
    Sys {
        what: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("cgroup: {0}")]
    Cgroup(#[source] io::Error),

    #[error("container: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("wait: {0}")]
    Wait(#[source] io::Error),

    #[error("write result: {0}")]
    Result(String),

    #[error("illegal transition {from} -> {to}")]
    Transition { from: Phase, to: Phase },
}

/// Lifecycle of one supervised execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    ConfigLoaded,
    RestrictionsApplied,
    ContainerBuilt,
    ChildRunning,
    ChildExited,
    DeadlineExceeded,
    Killed,
    ResultWritten,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Init, ConfigLoaded)
                | (ConfigLoaded, RestrictionsApplied)
                | (RestrictionsApplied, ContainerBuilt)
                | (ContainerBuilt, ChildRunning)
                | (ChildRunning, ChildExited)
                | (ChildRunning, DeadlineExceeded)
                | (DeadlineExceeded, Killed)
                | (ChildExited, ResultWritten)
                | (Killed, ResultWritten)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Tracker {
    phase: Phase,
}

impl Tracker {
    fn new() -> Self {
        Self { phase: Phase::Init }
    }

    fn advance(&mut self, next: Phase) -> Result<(), SupervisorError> {
        if !self.phase.can_advance_to(next) {
            return Err(SupervisorError::Transition {
                from: self.phase,
                to: next,
            });
        }
        debug!(from = %self.phase, to = %next, "supervisor phase");
        self.phase = next;
        Ok(())
    }
}

/// Entry point of the `supervise` subcommand.
pub fn run() -> Result<(), SupervisorError> {
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(|source| SupervisorError::Sys {
        what: "set parent death signal",
        source,
    })?;
    let mut tracker = Tracker::new();

    // SAFETY: the launcher placed these descriptors and nothing else owns them.
    let request_file = unsafe { File::from_raw_fd(supervise::REQUEST_FD) };
    let request: WorkerRequest = rmp_serde::from_read(request_file)?;
    let status_file = unsafe { File::from_raw_fd(supervise::STATUS_FD) };
    tracker.advance(Phase::ConfigLoaded)?;
    info!(owner = %request.owner, script = %request.name, deadline_ms = request.deadline_ms,
          "supervisor request loaded");

    let script = validate(&request)?;

    for (resource, limit) in rlimits(&request) {
        setrlimit(resource, limit, limit).map_err(|source| SupervisorError::Sys {
            what: "setrlimit",
            source,
        })?;
    }

    let instance = format!("meterbox-{}", std::process::id());
    let cgroup = match &request.cgroup_parent {
        Some(parent) => Some(
            Cgroup::create(parent, &instance, &cgroup_limits(&request))
                .map_err(SupervisorError::Cgroup)?,
        ),
        None => None,
    };
    tracker.advance(Phase::RestrictionsApplied)?;

    let staging = request.staging.join(&instance);
    let config = container_config(&request, &staging, cgroup.as_ref().map(|c| c.path()));
    let process = process_spec(&request, &script);
    tracker.advance(Phase::ContainerBuilt)?;

    let started = Instant::now();
    let pid = match NamespaceFactory.start(&config, &process) {
        Ok(pid) => pid,
        Err(err) => {
            if let Some(cgroup) = cgroup {
                cgroup.remove();
            }
            return Err(err.into());
        }
    };
    tracker.advance(Phase::ChildRunning)?;

    // The script holds its own copies now.
    for fd in [
        supervise::STDIN_FD,
        supervise::STDOUT_FD,
        supervise::STDERR_FD,
        supervise::CONTROL_FD,
    ] {
        unsafe { libc::close(fd) };
    }

    let deadline = Duration::from_millis(request.deadline_ms);
    let outcome = wait_with_backstop(pid, deadline, &mut tracker);

    if let Some(cgroup) = cgroup {
        cgroup.remove();
    }
    if let Err(err) = fs::remove_dir(&staging) {
        debug!(path = %staging.display(), error = %err, "staging not removed");
    }

    let (raw, rusage, time_limit_exceeded) = outcome?;
    let result = WorkerResult {
        status: ExitStatus::from_raw(raw),
        time_limit_exceeded,
        real_time_ms: started.elapsed().as_millis() as u64,
        user_time_ms: rusage.user.as_millis() as u64,
        system_time_ms: rusage.system.as_millis() as u64,
    };
    write_result(status_file, &result)?;
    tracker.advance(Phase::ResultWritten)?;
    info!(status = ?result.status, tle = time_limit_exceeded, "supervisor done");
    Ok(())
}

/// Path of the script inside the sandbox, after checking it exists on the
/// host. Both resolutions go through the same grammar and parent check.
fn validate(request: &WorkerRequest) -> Result<String, SupervisorError> {
    let host = scripts::script_path(&request.scripts_root, &request.owner, &request.name)?;
    if !host.is_file() {
        return Err(ExecError::NotFound(format!("{}/{}", request.owner, request.name)).into());
    }
    let inside = scripts::script_path(Path::new(abi::SCRIPTS_MOUNT), &request.owner, &request.name)?;
    Ok(inside.display().to_string())
}

fn rlimits(request: &WorkerRequest) -> Vec<(Resource, u64)> {
    let cpu_seconds = request.deadline_ms.div_ceil(1000).max(1);
    vec![
        (Resource::RLIMIT_AS, ADDRESS_SPACE_LIMIT.max(request.memory_limit)),
        (Resource::RLIMIT_CORE, 0),
        (Resource::RLIMIT_CPU, cpu_seconds),
        (Resource::RLIMIT_NOFILE, request.traits.open_file_limit),
        (Resource::RLIMIT_NPROC, request.traits.process_limit),
        (Resource::RLIMIT_STACK, STACK_LIMIT),
        (Resource::RLIMIT_FSIZE, FILE_SIZE_LIMIT),
    ]
}

fn cgroup_limits(request: &WorkerRequest) -> CgroupLimits {
    CgroupLimits {
        memory_max: request.memory_limit,
        pids_max: request.traits.process_limit,
        cpu_weight: request.traits.cpu_shares,
        io_weight: request.traits.blkio_weight,
    }
}

/// The sandbox for `request`, assembled under `staging`.
pub fn container_config(request: &WorkerRequest, staging: &Path, cgroup: Option<&Path>) -> ContainerConfig {
    let mut namespaces = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWUTS;
    if !request.traits.allow_network_access {
        namespaces |= CloneFlags::CLONE_NEWNET;
    }

    let mut mounts = vec![
        MountSpec {
            kind: MountKind::Proc,
            source: None,
            target: PathBuf::from("/proc"),
        },
        MountSpec {
            kind: MountKind::Devices,
            source: None,
            target: PathBuf::from("/dev"),
        },
        MountSpec {
            kind: MountKind::Bind { readonly: false },
            source: Some(request.storage.clone()),
            target: PathBuf::from(abi::STORAGE_MOUNT),
        },
        MountSpec {
            kind: MountKind::Bind { readonly: true },
            source: Some(request.scripts_root.clone()),
            target: PathBuf::from(abi::SCRIPTS_MOUNT),
        },
        MountSpec {
            kind: MountKind::Bind { readonly: true },
            source: Some(request.library.clone()),
            target: PathBuf::from(abi::LIBRARY_MOUNT),
        },
    ];
    if request.traits.tmpfs_size > 0 {
        mounts.push(MountSpec {
            kind: MountKind::Tmpfs {
                size: Some(request.traits.tmpfs_size),
            },
            source: None,
            target: PathBuf::from("/tmp"),
        });
    }

    ContainerConfig {
        rootfs: request.chroot.clone(),
        staging: staging.to_path_buf(),
        readonly_root: true,
        hostname: "sandbox".to_string(),
        namespaces,
        mounts,
        uid: abi::NOBODY_UID,
        gid: abi::NOBODY_GID,
        cwd: PathBuf::from(abi::STORAGE_MOUNT),
        denied_syscalls: request.denied_syscalls.clone(),
        cgroup: cgroup.map(Path::to_path_buf),
    }
}

fn process_spec(request: &WorkerRequest, script: &str) -> ProcessSpec {
    ProcessSpec {
        program: abi::SHELL.to_string(),
        args: vec![
            "sh".to_string(),
            "-c".to_string(),
            abi::SHELL_EXEC.to_string(),
            script.to_string(),
        ],
        env: vec![
            ("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()),
            ("HOME".into(), abi::STORAGE_MOUNT.into()),
            (abi::CONTEXT_ENV.into(), request.context.clone()),
        ],
        fds: vec![
            (supervise::STDIN_FD, 0),
            (supervise::STDOUT_FD, 1),
            (supervise::STDERR_FD, 2),
            (supervise::CONTROL_FD, abi::CONTROL_FD),
        ],
        close: (abi::CONTROL_FD + 1..=supervise::CONTROL_FD).collect(),
    }
}

/// Wait for `pid`, killing it at `deadline`. The host enforces the same
/// deadline; this one holds even if the host is gone.
fn wait_with_backstop(
    pid: Pid,
    deadline: Duration,
    tracker: &mut Tracker,
) -> Result<(i32, Rusage, bool), SupervisorError> {
    let (tx, rx) = mpsc::channel();
    let raw = pid.as_raw();
    std::thread::spawn(move || {
        let _ = tx.send(wait_rusage(raw));
    });

    match rx.recv_timeout(deadline) {
        Ok(reaped) => {
            tracker.advance(Phase::ChildExited)?;
            let (status, rusage) = reaped.map_err(SupervisorError::Wait)?;
            Ok((status, rusage, false))
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            tracker.advance(Phase::DeadlineExceeded)?;
            warn!(pid = raw, ?deadline, "script over deadline, killing");
            // Init of the pid namespace; its death takes the rest along.
            if let Err(err) = kill(pid, Signal::SIGKILL) {
                warn!(pid = raw, error = %err, "kill failed");
            }
            tracker.advance(Phase::Killed)?;
            let reaped = rx
                .recv()
                .map_err(|_| SupervisorError::Wait(io::Error::other("waiter vanished")))?;
            let (status, rusage) = reaped.map_err(SupervisorError::Wait)?;
            Ok((status, rusage, true))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(SupervisorError::Wait(io::Error::other("waiter vanished")))
        }
    }
}

fn write_result(mut file: File, result: &WorkerResult) -> Result<(), SupervisorError> {
    let bytes = rmp_serde::to_vec_named(result).map_err(|e| SupervisorError::Result(e.to_string()))?;
    file.write_all(&bytes)
        .map_err(|e| SupervisorError::Result(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WorkerRequest {
        WorkerRequest {
            owner: "alice".into(),
            name: "hello".into(),
            context: r#"{"channel":"c1"}"#.into(),
            traits: AccountTraits::default(),
            memory_limit: 64 << 20,
            deadline_ms: 1500,
            chroot: "/srv/chroot".into(),
            staging: "/run/meterbox".into(),
            storage: "/srv/volumes/alice".into(),
            scripts_root: "/srv/scripts".into(),
            library: "/srv/lib".into(),
            cgroup_parent: None,
            denied_syscalls: crate::seccomp::default_denied(),
        }
    }

    #[test]
    fn phases_follow_the_lifecycle() {
        use Phase::*;
        let happy = [Init, ConfigLoaded, RestrictionsApplied, ContainerBuilt, ChildRunning, ChildExited, ResultWritten];
        for pair in happy.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(ChildRunning.can_advance_to(DeadlineExceeded));
        assert!(DeadlineExceeded.can_advance_to(Killed));
        assert!(Killed.can_advance_to(ResultWritten));

        assert!(!Init.can_advance_to(ChildRunning));
        assert!(!DeadlineExceeded.can_advance_to(ResultWritten));
        assert!(!ResultWritten.can_advance_to(Init));
    }

    #[test]
    fn tracker_rejects_skipped_phases() {
        let mut tracker = Tracker::new();
        tracker.advance(Phase::ConfigLoaded).unwrap();
        let err = tracker.advance(Phase::ChildRunning).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Transition {
                from: Phase::ConfigLoaded,
                to: Phase::ChildRunning
            }
        ));
    }

    #[test]
    fn network_is_isolated_unless_granted() {
        let staging = Path::new("/run/meterbox/x");
        let config = container_config(&request(), staging, None);
        assert!(config.namespaces.contains(CloneFlags::CLONE_NEWNET));
        assert!(config.readonly_root);
        assert_eq!(config.uid, abi::NOBODY_UID);

        let mut open = request();
        open.traits.allow_network_access = true;
        let config = container_config(&open, staging, None);
        assert!(!config.namespaces.contains(CloneFlags::CLONE_NEWNET));
        assert!(config.namespaces.contains(CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn mounts_storage_rw_and_code_ro() {
        let config = container_config(&request(), Path::new("/run/x"), Some(Path::new("/cg/x")));
        let find = |target: &str| {
            config
                .mounts
                .iter()
                .find(|m| m.target == Path::new(target))
                .unwrap_or_else(|| panic!("{target} not mounted"))
        };
        assert_eq!(find("/mnt/storage").kind, MountKind::Bind { readonly: false });
        assert_eq!(find("/mnt/scripts").kind, MountKind::Bind { readonly: true });
        assert_eq!(find("/usr/lib/meterbox").kind, MountKind::Bind { readonly: true });
        assert_eq!(find("/proc").kind, MountKind::Proc);
        assert!(!config.mounts.iter().any(|m| m.target == Path::new("/tmp")));
        assert_eq!(config.cgroup.as_deref(), Some(Path::new("/cg/x")));

        let mut with_tmp = request();
        with_tmp.traits.tmpfs_size = 1 << 20;
        let config = container_config(&with_tmp, Path::new("/run/x"), None);
        let tmp = config.mounts.last().unwrap();
        assert_eq!(tmp.target, Path::new("/tmp"));
        assert_eq!(tmp.kind, MountKind::Tmpfs { size: Some(1 << 20) });
    }

    #[test]
    fn process_moves_control_to_three_and_closes_the_rest() {
        let spec = process_spec(&request(), "/mnt/scripts/alice/hello");
        assert_eq!(spec.fds, [(3, 0), (4, 1), (5, 2), (8, 3)]);
        assert_eq!(spec.close, [4, 5, 6, 7, 8]);
        assert_eq!(spec.args.last().unwrap(), "/mnt/scripts/alice/hello");
        assert!(spec
            .env
            .contains(&("SCRIPT_CONTEXT".to_string(), r#"{"channel":"c1"}"#.to_string())));
    }

    #[test]
    fn rlimits_follow_traits() {
        let limits = rlimits(&request());
        let get = |r: Resource| limits.iter().find(|(res, _)| *res == r).unwrap().1;
        assert_eq!(get(Resource::RLIMIT_CPU), 2);
        assert_eq!(get(Resource::RLIMIT_CORE), 0);
        assert_eq!(get(Resource::RLIMIT_NOFILE), 64);
        assert_eq!(get(Resource::RLIMIT_NPROC), 32);
    }

    #[test]
    fn traversal_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut bad = request();
        bad.scripts_root = dir.path().to_path_buf();
        bad.name = "../../etc/passwd".into();
        assert!(matches!(
            validate(&bad),
            Err(SupervisorError::Invalid(ExecError::InvalidArgument(_)))
        ));

        std::fs::create_dir_all(dir.path().join("alice")).unwrap();
        std::fs::write(dir.path().join("alice/hello"), "#!/bin/sh\n").unwrap();
        let mut good = request();
        good.scripts_root = dir.path().to_path_buf();
        assert_eq!(validate(&good).unwrap(), "/mnt/scripts/alice/hello");
    }

    #[test]
    fn request_survives_messagepack() {
        let bytes = rmp_serde::to_vec_named(&request()).unwrap();
        let back: WorkerRequest = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, request());
    }
}
