use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::slots::SlotId;

/// Reconstruction mode requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconType {
    /// Quick preview over a range of candidate rotation centers.
    Try,
    /// Complete reconstruction at a fixed rotation center.
    Full,
}

impl ReconType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconType::Try => "try",
            ReconType::Full => "full",
        }
    }

    /// Capitalized form used in status texts and job labels.
    pub fn title(&self) -> &'static str {
        match self {
            ReconType::Try => "Try",
            ReconType::Full => "Full",
        }
    }
}

impl std::fmt::Display for ReconType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the rotation center is chosen by the reconstruction tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorMethod {
    #[default]
    Manual,
    Auto,
}

impl CorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorMethod::Manual => "manual",
            CorMethod::Auto => "auto",
        }
    }
}

impl std::fmt::Display for CorMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution host of a job, resolved once when the job is submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Machine {
    #[default]
    Local,
    Remote(String),
}

impl Machine {
    pub const LOCAL_LABEL: &'static str = "Local";

    /// Resolve a machine selector label. `"Local"` (or an empty label) is the
    /// local host, anything else names a remote host.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if label.is_empty() || label == Self::LOCAL_LABEL {
            Machine::Local
        } else {
            Machine::Remote(label.to_string())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Machine::Local)
    }

    pub fn label(&self) -> &str {
        match self {
            Machine::Local => Self::LOCAL_LABEL,
            Machine::Remote(host) => host,
        }
    }
}

impl std::fmt::Display for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a job ended in the failed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The process could not be started at all.
    SpawnFailed(String),
    /// The process ran and exited with a non-zero code.
    NonZeroExit(i32),
    /// The process was killed by a signal or its state could not be read.
    Terminated(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::SpawnFailed(reason) => write!(f, "failed to start: {}", reason),
            FailureKind::NonZeroExit(code) => write!(f, "exit code {}", code),
            FailureKind::Terminated(reason) => write!(f, "terminated: {}", reason),
        }
    }
}

/// Coarse classification the status sink uses for coloring rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorClass {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
    Skipped,
}

impl ColorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorClass::Queued => "queued",
            ColorClass::Running => "running",
            ColorClass::Done => "done",
            ColorClass::Failed => "failed",
            ColorClass::Cancelled => "cancelled",
            ColorClass::Skipped => "skipped",
        }
    }

    /// Display color conventionally attached to the class.
    pub fn color(&self) -> &'static str {
        match self {
            ColorClass::Queued => "blue",
            ColorClass::Running => "yellow",
            ColorClass::Done => "green",
            ColorClass::Failed | ColorClass::Cancelled => "red",
            ColorClass::Skipped => "gray",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running { slot: SlotId },
    Completed,
    Failed(FailureKind),
    Skipped(String),
    Cancelled,
}

impl JobStatus {
    /// Terminal states all count toward the completed total of a run.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running { .. })
    }

    pub fn color_class(&self) -> ColorClass {
        match self {
            JobStatus::Queued => ColorClass::Queued,
            JobStatus::Running { .. } => ColorClass::Running,
            JobStatus::Completed => ColorClass::Done,
            JobStatus::Failed(_) => ColorClass::Failed,
            JobStatus::Skipped(_) => ColorClass::Skipped,
            JobStatus::Cancelled => ColorClass::Cancelled,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running { slot } => write!(f, "running on {}", slot),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed(kind) => write!(f, "failed ({})", kind),
            JobStatus::Skipped(reason) => write!(f, "skipped ({})", reason),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("no COR value for {recon_type} reconstruction")]
    MissingCor { recon_type: ReconType },

    #[error("invalid COR value {value}")]
    InvalidCor { value: f64 },
}

/// One reconstruction pass over one input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub filename: String,
    pub recon_type: ReconType,
    pub machine: Machine,
    pub cor_value: Option<f64>,
    pub cor_method: CorMethod,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(file_path: impl Into<PathBuf>, recon_type: ReconType) -> Self {
        let file_path = file_path.into();
        let filename = display_name(&file_path);
        Self {
            id: Uuid::new_v4(),
            file_path,
            filename,
            recon_type,
            machine: Machine::Local,
            cor_value: None,
            cor_method: CorMethod::default(),
            status: JobStatus::Queued,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_cor(mut self, cor: f64) -> Self {
        self.cor_value = Some(cor);
        self
    }

    pub fn with_cor_method(mut self, method: CorMethod) -> Self {
        self.cor_method = method;
        self
    }

    pub fn with_machine(mut self, machine: Machine) -> Self {
        self.machine = machine;
        self
    }

    /// Last four characters of the scan stem, e.g. `0123` for `scan_0123.h5`.
    pub fn scan_id(&self) -> String {
        let stem = self
            .file_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let chars: Vec<char> = stem.chars().collect();
        let start = chars.len().saturating_sub(4);
        chars[start..].iter().collect()
    }

    /// First eight hex digits of the job ID, unique enough within one run.
    pub fn short_id(&self) -> String {
        let mut id = self.id.simple().to_string();
        id.truncate(8);
        id
    }

    /// Short label used in log lines, e.g. `Full recon-0123`.
    pub fn label(&self) -> String {
        let scan = self.scan_id();
        if scan.is_empty() {
            format!("{} recon", self.recon_type.title())
        } else {
            format!("{} recon-{}", self.recon_type.title(), scan)
        }
    }

    /// Check the COR value against the job's mode.
    ///
    /// Full jobs always need a finite COR. Try jobs need one unless the
    /// rotation axis is detected automatically, in which case any supplied
    /// value is ignored and `Ok(None)` is returned.
    pub fn validated_cor(&self) -> Result<Option<f64>, ValidationError> {
        if self.recon_type == ReconType::Try && self.cor_method == CorMethod::Auto {
            return Ok(None);
        }
        match self.cor_value {
            None => Err(ValidationError::MissingCor {
                recon_type: self.recon_type,
            }),
            Some(value) if !value.is_finite() => Err(ValidationError::InvalidCor { value }),
            Some(value) => Ok(Some(value)),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
