//! Container construction.
//!
//! A [`ContainerConfig`] describes the sandbox declaratively; a
//! [`ContainerFactory`] turns it into a running process. The native factory
//! clones into fresh namespaces, assembles the root under a staging
//! directory, chroots, drops privileges, installs the syscall filter and
//! execs.

use nix::mount::{mount, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{chdir, chroot, execve, setgid, setgroups, sethostname, setuid, Gid, Pid, Uid};
use std::ffi::CString;
use std::fs;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

use crate::seccomp;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{what}: {source}")]
    Sys {
        what: String,
        #[source]
        source: nix::Error,
    },

    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("seccomp: {0}")]
    Seccomp(#[from] seccomp::SeccompError),

    #[error("bad process argument: {0}")]
    Argument(String),
}

fn sys(what: impl Into<String>) -> impl FnOnce(nix::Error) -> SandboxError {
    let what = what.into();
    move |source| SandboxError::Sys { what, source }
}

fn io_err(what: impl Into<String>) -> impl FnOnce(io::Error) -> SandboxError {
    let what = what.into();
    move |source| SandboxError::Io { what, source }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Bind { readonly: bool },
    Proc,
    Tmpfs { size: Option<u64> },
    /// tmpfs with the host's null, zero, random and urandom bound in.
    Devices,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: Option<PathBuf>,
    /// Absolute path inside the sandbox.
    pub target: PathBuf,
}

/// Declarative description of one sandbox.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Prepared directory bound as the root.
    pub rootfs: PathBuf,
    /// Empty host directory the root is assembled on.
    pub staging: PathBuf,
    pub readonly_root: bool,
    pub hostname: String,
    pub namespaces: CloneFlags,
    /// Applied in order after the root.
    pub mounts: Vec<MountSpec>,
    pub uid: u32,
    pub gid: u32,
    pub cwd: PathBuf,
    pub denied_syscalls: Vec<String>,
    /// cgroup directory the container joins before anything else.
    pub cgroup: Option<PathBuf>,
}

/// What to exec once the container is up.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `(from, to)` descriptor moves, applied in order.
    pub fds: Vec<(RawFd, RawFd)>,
    /// Descriptors to close after the moves.
    pub close: Vec<RawFd>,
}

pub trait ContainerFactory {
    /// Materialize `config` and start `process` in it. Returns the pid of
    /// the container's init process.
    fn start(&self, config: &ContainerConfig, process: &ProcessSpec) -> Result<Pid, SandboxError>;
}

/// Builds containers with clone(2) namespaces, bind mounts and chroot.
pub struct NamespaceFactory;

const STACK_SIZE: usize = 1024 * 1024;

impl ContainerFactory for NamespaceFactory {
    fn start(&self, config: &ContainerConfig, process: &ProcessSpec) -> Result<Pid, SandboxError> {
        // Everything the child needs is prepared here so a bad argument is
        // reported to the caller instead of dying silently after clone.
        let filter = seccomp::build_filter(&config.denied_syscalls)?;
        let program = cstring(&process.program)?;
        let args = process
            .args
            .iter()
            .map(|a| cstring(a))
            .collect::<Result<Vec<_>, _>>()?;
        let env = process
            .env
            .iter()
            .map(|(k, v)| cstring(&format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()?;

        fs::create_dir_all(&config.staging).map_err(io_err("mkdir staging"))?;

        let mut stack = vec![0u8; STACK_SIZE];
        let child_fn = Box::new(|| {
            let err = match enter(config, process, &filter) {
                Ok(()) => match execve(&program, &args, &env) {
                    Ok(never) => match never {},
                    Err(e) => SandboxError::Sys {
                        what: "exec".into(),
                        source: e,
                    },
                },
                Err(e) => e,
            };
            eprintln!("sandbox child: {err}");
            let _ = io::stderr().flush();
            127
        });

        info!(namespaces = ?config.namespaces, root = ?config.staging, "cloning sandbox");
        let pid = unsafe {
            clone(
                child_fn,
                &mut stack,
                config.namespaces,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(sys("clone"))?;
        info!(pid = pid.as_raw(), "sandbox init started");
        Ok(pid)
    }
}

fn cstring(s: &str) -> Result<CString, SandboxError> {
    CString::new(s).map_err(|_| SandboxError::Argument(s.to_string()))
}

/// Runs in the cloned child, up to the exec.
fn enter(config: &ContainerConfig, process: &ProcessSpec, filter: &seccomp::Filter) -> Result<(), SandboxError> {
    if let Some(cgroup) = &config.cgroup {
        // "0" is the writing task.
        fs::write(cgroup.join("cgroup.procs"), "0").map_err(io_err("join cgroup"))?;
    }

    // Keep our mounts out of the host's mount table.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(sys("make / private"))?;

    assemble_root(config)?;
    chroot(&config.staging).map_err(sys("chroot"))?;
    chdir(&config.cwd).map_err(sys("chdir"))?;

    if config.namespaces.contains(CloneFlags::CLONE_NEWUTS) {
        sethostname(&config.hostname).map_err(sys("sethostname"))?;
    }
    if config.namespaces.contains(CloneFlags::CLONE_NEWNET) {
        loopback_up().map_err(io_err("bring up lo"))?;
    }

    for (from, to) in &process.fds {
        if unsafe { libc::dup2(*from, *to) } < 0 {
            return Err(SandboxError::Io {
                what: format!("dup2 {from} -> {to}"),
                source: io::Error::last_os_error(),
            });
        }
    }
    for fd in &process.close {
        unsafe { libc::close(*fd) };
    }

    setgroups(&[]).map_err(sys("setgroups"))?;
    setgid(Gid::from_raw(config.gid)).map_err(sys("setgid"))?;
    setuid(Uid::from_raw(config.uid)).map_err(sys("setuid"))?;

    seccomp::install(filter)?;
    Ok(())
}

fn inside(root: &Path, target: &Path) -> PathBuf {
    root.join(target.strip_prefix("/").unwrap_or(target))
}

fn assemble_root(config: &ContainerConfig) -> Result<(), SandboxError> {
    let root = &config.staging;
    mount(
        Some(&config.rootfs),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(sys(format!("bind root {}", config.rootfs.display())))?;

    for spec in &config.mounts {
        apply_mount(root, spec)?;
    }

    if config.readonly_root {
        mount(
            None::<&str>,
            root,
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(sys("remount root ro"))?;
    }
    Ok(())
}

fn apply_mount(root: &Path, spec: &MountSpec) -> Result<(), SandboxError> {
    let target = inside(root, &spec.target);
    let label = spec.target.display().to_string();
    fs::create_dir_all(&target).map_err(io_err(format!("mkdir {label}")))?;

    match &spec.kind {
        MountKind::Bind { readonly } => {
            let source = spec
                .source
                .as_deref()
                .ok_or_else(|| SandboxError::Argument(format!("bind {label} without source")))?;
            mount(
                Some(source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .map_err(sys(format!("bind {label}")))?;
            let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
            if *readonly {
                flags |= MsFlags::MS_RDONLY;
            }
            mount(None::<&str>, &target, None::<&str>, flags, None::<&str>)
                .map_err(sys(format!("remount {label}")))?;
        }
        MountKind::Proc => {
            mount(
                Some("proc"),
                &target,
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(sys("mount proc"))?;
        }
        MountKind::Tmpfs { size } => {
            let data = match size {
                Some(size) => format!("size={size},mode=1777"),
                None => "mode=1777".to_string(),
            };
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
                Some(data.as_str()),
            )
            .map_err(sys(format!("tmpfs {label}")))?;
        }
        MountKind::Devices => {
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
                Some("size=64k,mode=755"),
            )
            .map_err(sys("tmpfs /dev"))?;
            for dev in ["null", "zero", "urandom", "random"] {
                let host_dev = format!("/dev/{dev}");
                if !Path::new(&host_dev).exists() {
                    continue;
                }
                let node = target.join(dev);
                fs::write(&node, "").map_err(io_err(format!("touch /dev/{dev}")))?;
                fs::set_permissions(&node, fs::Permissions::from_mode(0o666))
                    .map_err(io_err(format!("chmod /dev/{dev}")))?;
                mount(
                    Some(host_dev.as_str()),
                    &node,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(sys(format!("bind /dev/{dev}")))?;
            }
        }
    }
    Ok(())
}

/// A fresh network namespace starts with `lo` down.
fn loopback_up() -> io::Result<()> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let sock = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inside_strips_leading_slash() {
        assert_eq!(
            inside(Path::new("/run/x"), Path::new("/mnt/storage")),
            PathBuf::from("/run/x/mnt/storage")
        );
    }

    #[test]
    fn nul_in_argument_is_rejected_before_clone() {
        let config = ContainerConfig {
            rootfs: PathBuf::from("/nonexistent"),
            staging: PathBuf::from("/nonexistent/staging"),
            readonly_root: true,
            hostname: "sandbox".into(),
            namespaces: CloneFlags::CLONE_NEWNS,
            mounts: Vec::new(),
            uid: 65534,
            gid: 65534,
            cwd: PathBuf::from("/"),
            denied_syscalls: Vec::new(),
            cgroup: None,
        };
        let process = ProcessSpec {
            program: "/bin/sh".into(),
            args: vec!["sh".into(), "bad\0arg".into()],
            env: Vec::new(),
            fds: Vec::new(),
            close: Vec::new(),
        };
        assert!(matches!(
            NamespaceFactory.start(&config, &process),
            Err(SandboxError::Argument(_))
        ));
    }
}
