//! Per-account storage volumes.
//!
//! A single task owns the table of mounted volumes; callers talk to it over
//! a channel. Mounting an account that is already mounted returns the
//! existing path.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::abi;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{what}: {source}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("empty command line for {0}")]
    EmptyCommand(&'static str),

    #[error("mounter stopped")]
    Stopped,
}

fn io_err(what: impl Into<String>) -> impl FnOnce(io::Error) -> MountError {
    let what = what.into();
    move |source| MountError::Io { what, source }
}

#[async_trait]
pub trait VolumeBackend: Send + Sync {
    /// Make `account`'s volume available and return its host path.
    async fn mount(&self, account: &str) -> Result<PathBuf, MountError>;

    async fn unmount(&self, path: &Path) -> Result<(), MountError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeConfig {
    /// A plain directory per account.
    Directory { root: PathBuf },
    /// A filesystem image per account, created on first use.
    Image {
        images: PathBuf,
        mounts: PathBuf,
        /// Bytes.
        #[serde(default = "default_image_size")]
        size: u64,
        #[serde(default = "default_mkfs")]
        mkfs: Vec<String>,
        #[serde(default = "default_mount")]
        mount: Vec<String>,
        #[serde(default = "default_unmount")]
        unmount: Vec<String>,
    },
}

fn default_image_size() -> u64 {
    20 * 1024 * 1024
}

fn default_mkfs() -> Vec<String> {
    vec!["mkfs.ext4".into(), "-q".into(), "-F".into()]
}

fn default_mount() -> Vec<String> {
    vec!["mount".into(), "-o".into(), "loop,nosuid,nodev".into()]
}

fn default_unmount() -> Vec<String> {
    vec!["umount".into()]
}

impl VolumeConfig {
    pub fn backend(&self) -> Box<dyn VolumeBackend> {
        match self.clone() {
            VolumeConfig::Directory { root } => Box::new(DirectoryBackend::new(root)),
            VolumeConfig::Image {
                images,
                mounts,
                size,
                mkfs,
                mount,
                unmount,
            } => Box::new(ImageBackend {
                images,
                mounts,
                size,
                mkfs,
                mount,
                unmount,
            }),
        }
    }
}

fn volume_name(account: &str) -> String {
    URL_SAFE_NO_PAD.encode(account)
}

/// Hand the volume root to the sandbox user when we can.
fn give_to_sandbox(path: &Path) -> Result<(), MountError> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(abi::NOBODY_UID)),
        Some(nix::unistd::Gid::from_raw(abi::NOBODY_GID)),
    )
    .map_err(|e| MountError::Io {
        what: format!("chown {}", path.display()),
        source: e.into(),
    })
}

pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl VolumeBackend for DirectoryBackend {
    async fn mount(&self, account: &str) -> Result<PathBuf, MountError> {
        let path = self.root.join(volume_name(account));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(io_err(format!("mkdir {}", path.display())))?;
        give_to_sandbox(&path)?;
        Ok(path)
    }

    async fn unmount(&self, _path: &Path) -> Result<(), MountError> {
        Ok(())
    }
}

pub struct ImageBackend {
    images: PathBuf,
    mounts: PathBuf,
    size: u64,
    mkfs: Vec<String>,
    mount: Vec<String>,
    unmount: Vec<String>,
}

async fn run(what: &'static str, argv: &[String], extra: &[&Path]) -> Result<(), MountError> {
    let (program, args) = argv.split_first().ok_or(MountError::EmptyCommand(what))?;
    let output = Command::new(program)
        .args(args)
        .args(extra)
        .output()
        .await
        .map_err(io_err(format!("run {program}")))?;
    if !output.status.success() {
        return Err(MountError::Command {
            program: program.clone(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl VolumeBackend for ImageBackend {
    async fn mount(&self, account: &str) -> Result<PathBuf, MountError> {
        let name = volume_name(account);
        let image = self.images.join(format!("{name}.img"));
        if !tokio::fs::try_exists(&image)
            .await
            .map_err(io_err(format!("stat {}", image.display())))?
        {
            info!(account, image = %image.display(), size = self.size, "creating volume image");
            let file = tokio::fs::File::create(&image)
                .await
                .map_err(io_err(format!("create {}", image.display())))?;
            file.set_len(self.size)
                .await
                .map_err(io_err(format!("truncate {}", image.display())))?;
            if let Err(err) = run("mkfs", &self.mkfs, &[&image]).await {
                let _ = tokio::fs::remove_file(&image).await;
                return Err(err);
            }
        }

        let target = self.mounts.join(&name);
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(io_err(format!("mkdir {}", target.display())))?;
        if let Err(err) = run("mount", &self.mount, &[&image, &target]).await {
            if let Err(rm) = tokio::fs::remove_dir(&target).await {
                warn!(path = %target.display(), error = %rm, "mount point not removed");
            }
            return Err(err);
        }
        give_to_sandbox(&target)?;
        Ok(target)
    }

    async fn unmount(&self, path: &Path) -> Result<(), MountError> {
        run("unmount", &self.unmount, &[path]).await?;
        tokio::fs::remove_dir(path)
            .await
            .map_err(io_err(format!("rmdir {}", path.display())))
    }
}

enum Request {
    Mount {
        account: String,
        reply: oneshot::Sender<Result<PathBuf, MountError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the task owning the mount table.
#[derive(Clone)]
pub struct Mounter {
    tx: mpsc::Sender<Request>,
}

impl Mounter {
    pub fn start(backend: Box<dyn VolumeBackend>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_table(backend, rx));
        Self { tx }
    }

    pub async fn mount(&self, account: &str) -> Result<PathBuf, MountError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Mount {
                account: account.to_string(),
                reply,
            })
            .await
            .map_err(|_| MountError::Stopped)?;
        rx.await.map_err(|_| MountError::Stopped)?
    }

    /// Unmount everything. Later mounts start from an empty table.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Request::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_table(backend: Box<dyn VolumeBackend>, mut rx: mpsc::Receiver<Request>) {
    let mut mounted: HashMap<String, PathBuf> = HashMap::new();
    while let Some(request) = rx.recv().await {
        match request {
            Request::Mount { account, reply } => {
                let result = match mounted.get(&account) {
                    Some(path) => Ok(path.clone()),
                    None => match backend.mount(&account).await {
                        Ok(path) => {
                            debug!(account = %account, path = %path.display(), "volume mounted");
                            mounted.insert(account, path.clone());
                            Ok(path)
                        }
                        Err(err) => Err(err),
                    },
                };
                let _ = reply.send(result);
            }
            Request::Close { reply } => {
                for (account, path) in mounted.drain() {
                    if let Err(err) = backend.unmount(&path).await {
                        warn!(account = %account, error = %err, "unmount failed");
                    }
                }
                let _ = reply.send(());
            }
        }
    }
}
