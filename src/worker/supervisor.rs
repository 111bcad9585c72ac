use std::fs::File;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::worker::command::{LaunchCommand, OutputTarget};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a process could not be started. Distinct from a process that started
/// and then exited with an error.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("executable not found: {program}")]
    NotFound { program: String },

    #[error("permission denied: {program}")]
    PermissionDenied { program: String },

    #[error("cannot open output file {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl SpawnError {
    fn from_io(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound {
                program: program.to_string(),
            },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied {
                program: program.to_string(),
            },
            _ => SpawnError::Io {
                program: program.to_string(),
                source: err,
            },
        }
    }

    fn output(path: &Path, err: io::Error) -> Self {
        SpawnError::Output {
            path: path.to_path_buf(),
            source: err,
        }
    }
}

/// Observed state of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// The process is gone. `code` is `None` when it was ended by a signal.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process state could not be read.
    Unknown(String),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

/// Starts external processes. Spawning never waits for the process to finish.
pub trait ProcessSupervisor: Send + Sync {
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

/// Handle to one started process. All calls are non-blocking.
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    fn poll(&mut self) -> ProcessState;

    /// Ask the process to exit (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit (SIGKILL)
    fn kill(&mut self) -> io::Result<()>;
}

/// How a process ended during a stop sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own or after the terminate request
    Graceful,
    /// Still running at the end of the grace period and force-killed
    Killed,
    /// The kill request itself failed
    Error(String),
}

/// Terminate every process, wait up to `grace` for all of them to exit, then
/// force-kill whatever is left. Outcomes are returned in input order.
pub async fn terminate_all(
    handles: &mut [Box<dyn ProcessHandle>],
    grace: Duration,
) -> Vec<StopOutcome> {
    for handle in handles.iter_mut() {
        if handle.poll().is_running() {
            match handle.terminate() {
                Ok(()) => tracing::debug!(pid = ?handle.pid(), "Sent SIGTERM"),
                Err(e) => tracing::warn!(pid = ?handle.pid(), error = %e, "Failed to send SIGTERM"),
            }
        }
    }

    let deadline = Instant::now() + grace;
    let mut outcomes: Vec<Option<StopOutcome>> = vec![None; handles.len()];

    loop {
        for (outcome, handle) in outcomes.iter_mut().zip(handles.iter_mut()) {
            if outcome.is_none() && !handle.poll().is_running() {
                *outcome = Some(StopOutcome::Graceful);
            }
        }

        if outcomes.iter().all(Option::is_some) {
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            for (outcome, handle) in outcomes.iter_mut().zip(handles.iter_mut()) {
                if outcome.is_some() {
                    continue;
                }
                *outcome = Some(match handle.kill() {
                    Ok(()) => {
                        tracing::warn!(pid = ?handle.pid(), "Grace period elapsed, process force killed");
                        StopOutcome::Killed
                    }
                    Err(e) => {
                        tracing::error!(pid = ?handle.pid(), error = %e, "Failed to kill process");
                        StopOutcome::Error(e.to_string())
                    }
                });
            }
            break;
        }

        tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
    }

    outcomes
        .into_iter()
        .map(|o| o.unwrap_or(StopOutcome::Graceful))
        .collect()
}

/// Runs processes on this host through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSupervisor;

impl LocalSupervisor {
    pub fn new() -> Self {
        Self
    }

    fn stdio_pair(output: &OutputTarget) -> Result<(Stdio, Stdio), SpawnError> {
        match output {
            OutputTarget::Inherit => Ok((Stdio::inherit(), Stdio::inherit())),
            OutputTarget::Null => Ok((Stdio::null(), Stdio::null())),
            OutputTarget::File(path) => {
                let stdout = File::create(path).map_err(|e| SpawnError::output(path, e))?;
                let stderr = stdout
                    .try_clone()
                    .map_err(|e| SpawnError::output(path, e))?;
                Ok((Stdio::from(stdout), Stdio::from(stderr)))
            }
        }
    }
}

impl ProcessSupervisor for LocalSupervisor {
    fn spawn(&self, command: &LaunchCommand) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        if command.program.is_empty() {
            return Err(SpawnError::EmptyCommand);
        }

        let (stdout, stderr) = Self::stdio_pair(&command.output)?;

        let child = Command::new(&command.program)
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::from_io(&command.program, e))?;

        tracing::debug!(program = %command.program, pid = ?child.id(), "Process started");

        Ok(Box::new(LocalProcess { child }))
    }
}

/// A child process started by [`LocalSupervisor`].
#[derive(Debug)]
pub struct LocalProcess {
    child: Child,
}

impl ProcessHandle for LocalProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn poll(&mut self) -> ProcessState {
        match self.child.try_wait() {
            Ok(None) => ProcessState::Running,
            Ok(Some(status)) => ProcessState::Exited {
                code: status.code(),
                signal: status.signal(),
            },
            Err(e) => ProcessState::Unknown(e.to_string()),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        // No pid means the child was already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}
