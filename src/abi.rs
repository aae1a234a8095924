//! Descriptor numbers shared by the launcher, the supervisor and scripts.
//!
//! These are an ABI: changing one side without the other breaks every
//! sandbox.

use std::os::fd::RawFd;

/// Control socket as seen by the script (all tools).
pub const CONTROL_FD: RawFd = 3;

/// Host log descriptor for tools that accept one (nsjail, unconfined).
pub const LOG_FD: RawFd = 4;

/// Descriptors handed to `meterbox supervise`.
pub mod supervise {
    use std::os::fd::RawFd;

    pub const STDIN_FD: RawFd = 3;
    pub const STDOUT_FD: RawFd = 4;
    pub const STDERR_FD: RawFd = 5;
    pub const STATUS_FD: RawFd = 6;
    pub const REQUEST_FD: RawFd = 7;
    pub const CONTROL_FD: RawFd = 8;
}

/// Environment variable carrying the serialized context into the script.
pub const CONTEXT_ENV: &str = "SCRIPT_CONTEXT";

/// In-sandbox mount points.
pub const STORAGE_MOUNT: &str = "/mnt/storage";
pub const SCRIPTS_MOUNT: &str = "/mnt/scripts";
pub const LIBRARY_MOUNT: &str = "/usr/lib/meterbox";

/// Wrapper used to exec scripts so interpreter lookup follows the shebang.
pub const SHELL: &str = "/bin/sh";
pub const SHELL_EXEC: &str = "exec \"$0\" \"$@\"";

/// Identity scripts run as.
pub const NOBODY_UID: u32 = 65534;
pub const NOBODY_GID: u32 = 65534;
