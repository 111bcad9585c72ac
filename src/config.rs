use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BatchError, Result};
use crate::scheduler::job::ReconType;

/// Timing knobs of the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Idle sleep between loop iterations when nothing changed
    pub poll_interval: Duration,
    /// How long a terminated process may take to exit before it is killed
    pub stop_grace_period: Duration,
    /// Capacity of the request channel into the scheduler task
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            stop_grace_period: Duration::from_millis(1500),
            channel_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }
}

/// Where a reconstruction process writes its stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the parent's terminal
    #[default]
    Inherit,
    /// Discard all output
    Null,
    /// One log file per job inside the directory
    LogDir(PathBuf),
}

/// Per-mode reconstruction settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSettings {
    /// Reconstruction subcommand, `recon` or `recon_steps`
    pub recon_way: String,
}

impl Default for ModeSettings {
    fn default() -> Self {
        Self {
            recon_way: "recon".to_string(),
        }
    }
}

/// Settings used to turn a job into a reconstruction command line.
#[derive(Debug, Clone)]
pub struct ReconSettings {
    /// Reconstruction executable
    pub executable: String,
    pub try_mode: ModeSettings,
    pub full_mode: ModeSettings,
    /// Configuration file handed to the tool. When set, `extra_args` are not
    /// appended.
    pub config_file: Option<PathBuf>,
    /// Additional flags appended after the generated arguments
    pub extra_args: Vec<String>,
    pub output: OutputMode,
}

impl Default for ReconSettings {
    fn default() -> Self {
        Self {
            executable: "tomocupy".to_string(),
            try_mode: ModeSettings::default(),
            full_mode: ModeSettings::default(),
            config_file: None,
            extra_args: Vec::new(),
            output: OutputMode::default(),
        }
    }
}

impl ReconSettings {
    pub fn mode(&self, recon_type: ReconType) -> &ModeSettings {
        match recon_type {
            ReconType::Try => &self.try_mode,
            ReconType::Full => &self.full_mode,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

/// Rotation centers keyed by scan, as stored in `rot_cen.json`:
/// `{ "/data/exp/scan_0001.h5": 1024.5, ... }`. Values may also be numeric
/// strings.
#[derive(Debug, Clone, Default)]
pub struct CorTable {
    entries: HashMap<String, f64>,
}

impl CorTable {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        let object = value
            .as_object()
            .ok_or_else(|| BatchError::CorFile("expected a JSON object".to_string()))?;

        let mut entries = HashMap::with_capacity(object.len());
        for (key, value) in object {
            let cor = match value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match cor {
                Some(cor) => {
                    entries.insert(key.clone(), cor);
                }
                None => tracing::warn!(scan = %key, value = %value, "Ignoring non-numeric COR entry"),
            }
        }
        Ok(Self { entries })
    }

    /// COR of a scan, looked up by full path first and file name second.
    pub fn lookup(&self, file_path: &Path) -> Option<f64> {
        if let Some(cor) = self.entries.get(file_path.to_string_lossy().as_ref()) {
            return Some(*cor);
        }
        let name = file_path.file_name()?.to_string_lossy();
        self.entries.get(name.as_ref()).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
