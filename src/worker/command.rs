use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{OutputMode, ReconSettings};
use crate::scheduler::job::{CorMethod, Job, Machine};
use crate::scheduler::slots::SlotId;

pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Destination of a process's stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputTarget {
    #[default]
    Inherit,
    Null,
    File(PathBuf),
}

/// A fully resolved command line ready to hand to a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Environment overrides on top of the parent environment
    pub env: BTreeMap<String, String>,
    pub output: OutputTarget,
}

impl LaunchCommand {
    /// Build from an argument vector whose first element is the program.
    pub fn from_argv(argv: Vec<String>) -> Option<Self> {
        let mut argv = argv.into_iter();
        let program = argv.next()?;
        Some(Self {
            program,
            args: argv.collect(),
            env: BTreeMap::new(),
            output: OutputTarget::default(),
        })
    }

    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-style rendering for logs and remote execution.
    pub fn to_shell_string(&self) -> String {
        self.argv()
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Turns a dispatched job into the reconstruction command line.
///
/// `cor` is the already validated rotation center, `None` when the tool
/// detects it automatically.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, job: &Job, slot: SlotId, cor: Option<f64>) -> LaunchCommand;
}

/// Builds `tomocupy` invocations.
#[derive(Debug, Clone, Default)]
pub struct TomocupyCommandBuilder {
    settings: ReconSettings,
}

impl TomocupyCommandBuilder {
    pub fn new(settings: ReconSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ReconSettings {
        &self.settings
    }

    fn output_for(&self, job: &Job, slot: SlotId) -> OutputTarget {
        match &self.settings.output {
            OutputMode::Inherit => OutputTarget::Inherit,
            OutputMode::Null => OutputTarget::Null,
            OutputMode::LogDir(dir) => {
                let stem = job
                    .file_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| job.id.to_string());
                OutputTarget::File(dir.join(format!(
                    "{}-{}-gpu{}-{}.log",
                    stem,
                    job.recon_type,
                    slot.index(),
                    job.short_id()
                )))
            }
        }
    }
}

impl CommandBuilder for TomocupyCommandBuilder {
    fn build(&self, job: &Job, slot: SlotId, cor: Option<f64>) -> LaunchCommand {
        let mode = self.settings.mode(job.recon_type);

        let mut args = vec![
            mode.recon_way.clone(),
            "--reconstruction-type".to_string(),
            job.recon_type.as_str().to_string(),
        ];
        if let Some(config) = &self.settings.config_file {
            args.push("--config".to_string());
            args.push(config.to_string_lossy().into_owned());
        }
        args.push("--file-name".to_string());
        args.push(job.file_path.to_string_lossy().into_owned());

        args.push("--rotation-axis-auto".to_string());
        args.push(job.cor_method.as_str().to_string());
        if job.cor_method == CorMethod::Manual {
            if let Some(cor) = cor {
                args.push("--rotation-axis".to_string());
                args.push(cor.to_string());
            }
        }

        if self.settings.config_file.is_none() {
            args.extend(self.settings.extra_args.iter().cloned());
        }

        let mut env = BTreeMap::new();
        if job.machine.is_local() {
            env.insert(CUDA_VISIBLE_DEVICES.to_string(), slot.index().to_string());
        }

        LaunchCommand {
            program: self.settings.executable.clone(),
            args,
            env,
            output: self.output_for(job, slot),
        }
    }
}

/// Routes a command to the machine a job targets.
pub trait RemoteWrapper: Send + Sync {
    /// Must return `command` unchanged for [`Machine::Local`].
    fn wrap(&self, command: LaunchCommand, machine: &Machine) -> LaunchCommand;
}

/// Runs remote commands through `ssh <host> "<command>"`. Assumes key-based
/// login is configured for every host.
#[derive(Debug, Clone)]
pub struct SshWrapper {
    ssh_program: String,
    options: Vec<String>,
}

impl Default for SshWrapper {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            options: Vec::new(),
        }
    }
}

impl SshWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra options placed before the host, e.g. `-o BatchMode=yes`.
    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }
}

impl RemoteWrapper for SshWrapper {
    fn wrap(&self, command: LaunchCommand, machine: &Machine) -> LaunchCommand {
        let host = match machine {
            Machine::Local => return command,
            Machine::Remote(host) => host,
        };

        let mut args = self.options.clone();
        args.push(host.clone());
        args.push(command.to_shell_string());

        // Environment overrides are not forwarded over ssh
        LaunchCommand {
            program: self.ssh_program.clone(),
            args,
            env: BTreeMap::new(),
            output: command.output,
        }
    }
}
