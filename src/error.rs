// Error taxonomy for the allocation engine
// Four kinds: configuration problems are skippable, validation problems fail
// the offending item, I/O problems are retryable, override conflicts guard
// user data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or unresolvable configuration (no rule for a category, no
    /// location resolved for a tracked code). Logged and skipped; the rest
    /// of the run continues.
    #[error("configuration: {0}")]
    Configuration(String),

    /// Malformed input (bad month string, percentages out of range,
    /// negative totals where none are allowed). Fails the offending
    /// category or load, not sibling categories.
    #[error("validation: {field}: {message}")]
    Validation { field: String, message: String },

    /// Store read/write failure. Retryable: allocation computation is pure
    /// and re-runnable from the ledger.
    #[error("store i/o: {0}")]
    Io(#[from] anyhow::Error),

    /// A write path would drop an overridden row that was never
    /// snapshotted. This is a programming bug surfaced as an error rather
    /// than silent data loss.
    #[error("override conflict: {0}")]
    OverrideConflict(String),
}

impl EngineError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Io(anyhow::Error::new(err).context("sqlite operation failed"))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
