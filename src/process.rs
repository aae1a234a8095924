//! Reaping children together with their resource accounting.

use serde::{Deserialize, Serialize};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_raw(status: i32) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus {
                exit_code: Some(libc::WEXITSTATUS(status)),
                signal: None,
            }
        } else if libc::WIFSIGNALED(status) {
            ExitStatus {
                exit_code: None,
                signal: Some(libc::WTERMSIG(status)),
            }
        } else {
            ExitStatus::default()
        }
    }

    /// nsjail reports a child killed by signal N as exit code 100 + N.
    pub fn from_nsjail(status: i32) -> Self {
        match Self::from_raw(status) {
            ExitStatus {
                exit_code: Some(code),
                ..
            } if code > 100 => ExitStatus {
                exit_code: None,
                signal: Some(code - 100),
            },
            other => other,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// CPU accounting from `wait4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rusage {
    pub user: Duration,
    pub system: Duration,
    /// Peak resident set, bytes.
    pub max_rss: u64,
}

/// Block until `pid` exits and return its raw wait status and rusage.
pub fn wait_rusage(pid: libc::pid_t) -> io::Result<(i32, Rusage)> {
    let mut status = 0;
    // SAFETY: rusage is plain old data.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        let ret = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    Ok((
        status,
        Rusage {
            user: timeval(usage.ru_utime),
            system: timeval(usage.ru_stime),
            max_rss: (usage.ru_maxrss.max(0) as u64) * 1024,
        },
    ))
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Send `signal` to the process group led by `pid`.
pub fn kill_group(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::killpg(pid, signal) } < 0 {
        let err = io::Error::last_os_error();
        // Already gone.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(err);
    }
    Ok(())
}

/// A child leading its own process group.
///
/// Signals go to the group only while the leader is unreaped, so a pid the
/// kernel has handed to someone else is never hit.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    pid: libc::pid_t,
    reaped: Arc<Mutex<bool>>,
}

impl ProcessGroup {
    pub fn new(pid: libc::pid_t) -> Self {
        Self {
            pid,
            reaped: Arc::new(Mutex::new(false)),
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Signal the group; a no-op once the leader is reaped.
    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        let reaped = self.reaped.lock().unwrap_or_else(|p| p.into_inner());
        if *reaped {
            return Ok(());
        }
        kill_group(self.pid, signal)
    }

    /// Block until the leader exits, kill what is left of its group while
    /// the leader still pins the id, then reap it.
    pub fn reap(&self) -> io::Result<(i32, Rusage)> {
        wait_exited(self.pid)?;
        let mut reaped = self.reaped.lock().unwrap_or_else(|p| p.into_inner());
        let _ = kill_group(self.pid, libc::SIGKILL);
        let result = wait_rusage(self.pid);
        *reaped = true;
        result
    }
}

/// Wait for `pid` to become a zombie without reaping it.
fn wait_exited(pid: libc::pid_t) -> io::Result<()> {
    loop {
        // SAFETY: siginfo_t is plain old data.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let ret = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
