use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("Cron expression must have 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid {field} value: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("Step must be positive in {field} field")]
    ZeroStep { field: &'static str },

    #[error("Inverted {field} range {start}-{end}")]
    InvertedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Built-in task cannot be modified: {0}")]
    Builtin(String),

    #[error("Failed to read tasks file: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to parse tasks file: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to create tasks directory: {0}")]
    CreateDirError(std::io::Error),
    #[error("Failed to write tasks file: {0}")]
    WriteError(std::io::Error),
}
