//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CartError>;

#[derive(Error, Debug)]
pub enum CartError {
    /// A feature name, value or vector layout does not agree with the schema,
    /// or a unit reaches no leaf of a skeleton tree.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Malformed trainer output for job {job}: {reason}")]
    MalformedTrainerOutput { job: usize, reason: String },

    #[error("Malformed skeleton tree at line {line}: {reason}")]
    MalformedSkeleton { line: usize, reason: String },

    #[error("Trainer process failed for job {job}: {reason}")]
    TrainerProcessFailure { job: usize, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CartError {
    /// Job id attached to a refinement failure, if any.
    pub fn job(&self) -> Option<usize> {
        match self {
            CartError::MalformedTrainerOutput { job, .. } | CartError::TrainerProcessFailure { job, .. } => Some(*job),
            _ => None,
        }
    }
}
