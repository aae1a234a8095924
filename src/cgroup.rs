//! Per-sandbox cgroup v2 group.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupLimits {
    /// `memory.max`, bytes.
    pub memory_max: u64,
    /// `pids.max`.
    pub pids_max: u64,
    /// `cpu.weight`, clamped to 1..=10000.
    pub cpu_weight: u32,
    /// `io.weight`, clamped to 1..=10000.
    pub io_weight: u32,
}

pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Create `<parent>/<name>` and write `limits`. The memory and pids
    /// ceilings must take; weights are best effort since the io controller
    /// is often unavailable.
    pub fn create(parent: &Path, name: &str, limits: &CgroupLimits) -> io::Result<Self> {
        enable_controllers(parent);

        let path = parent.join(name);
        fs::create_dir(&path)?;
        let cgroup = Self { path };

        cgroup.write("memory.max", &limits.memory_max.to_string())?;
        cgroup.write("pids.max", &limits.pids_max.to_string())?;
        if let Err(err) = cgroup.write("memory.swap.max", "0") {
            debug!(error = %err, "memory.swap.max not set");
        }
        if let Err(err) = cgroup.write("cpu.weight", &limits.cpu_weight.clamp(1, 10_000).to_string()) {
            warn!(error = %err, "cpu.weight not set");
        }
        let io = format!("default {}", limits.io_weight.clamp(1, 10_000));
        if let Err(err) = cgroup.write("io.weight", &io) {
            warn!(error = %err, "io.weight not set");
        }

        debug!(path = %cgroup.path.display(), ?limits, "cgroup created");
        Ok(cgroup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the group. It must be empty.
    pub fn remove(self) {
        if let Err(err) = fs::remove_dir(&self.path) {
            warn!(path = %self.path.display(), error = %err, "cgroup not removed");
        }
    }

    fn write(&self, file: &str, value: &str) -> io::Result<()> {
        fs::write(self.path.join(file), value)
            .map_err(|e| io::Error::new(e.kind(), format!("{file}: {e}")))
    }
}

fn enable_controllers(parent: &Path) {
    let control = parent.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&control).unwrap_or_default();
    for controller in ["memory", "pids", "cpu", "io"] {
        if enabled.split_whitespace().any(|c| c == controller) {
            continue;
        }
        if let Err(err) = fs::write(&control, format!("+{controller}")) {
            debug!(controller, error = %err, "controller not enabled");
        }
    }
}
