//! Process execution for reconstruction jobs.
//!
//! This module is the boundary between the scheduler and the operating system:
//! - **Command building**: turns a dispatched job into an argument vector plus
//!   environment overrides, pinning local jobs to their GPU slot
//! - **Remote wrapping**: routes commands for remote hosts through `ssh`
//! - **Supervision**: starts processes, polls them without blocking, and stops
//!   them with SIGTERM followed by SIGKILL
//!
//! # Components
//!
//! - [`CommandBuilder`] / [`TomocupyCommandBuilder`]: job to command line
//! - [`RemoteWrapper`] / [`SshWrapper`]: command to remote command
//! - [`ProcessSupervisor`] / [`LocalSupervisor`]: command to running process
//! - [`terminate_all`]: grace-period stop sequence shared by all handles

pub mod command;
pub mod supervisor;

pub use command::{
    CommandBuilder, LaunchCommand, OutputTarget, RemoteWrapper, SshWrapper,
    TomocupyCommandBuilder,
};
pub use supervisor::{
    terminate_all, LocalSupervisor, ProcessHandle, ProcessState, ProcessSupervisor, SpawnError,
    StopOutcome,
};
