//! meterbox: runs untrusted scripts in a Linux sandbox, bills them by wall
//! time and lets them call back into host services over a descriptor-passing
//! control channel.

#![cfg(target_os = "linux")]

pub mod abi;
pub mod accounts;
pub mod bridge;
pub mod budget;
pub mod cgroup;
pub mod config;
pub mod error;
pub mod http_server;
pub mod launcher;
pub mod ledger;
pub mod mounter;
pub mod orchestrator;
pub mod pricing;
pub mod process;
pub mod rpc;
pub mod sandbox;
pub mod scripts;
pub mod seccomp;
pub mod services;
pub mod state;
pub mod supervisor;

pub use error::{ExecError, Result};
pub use orchestrator::{ExecutionRequest, ExecutionResult, Orchestrator};
