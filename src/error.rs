use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch contains no jobs")]
    EmptyBatch,

    #[error("Invalid GPU slot count {0}, at least one slot is required")]
    InvalidSlotCount(usize),

    #[error("Scheduler is not running")]
    SchedulerUnavailable,

    #[error("COR file error: {0}")]
    CorFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BatchError>;
