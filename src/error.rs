//! Pipeline error tiers.
//!
//! Per-row data problems are deliberately absent here: they never abort a
//! job and travel as [`RowIssue`](casebridge_core::identifiers::RowIssue)
//! instead. Everything in [`ImportError`] ends the run.

use casebridge_core::models::EntityKind;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// The operator's mapping configuration can't be applied.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Cancellation was requested; not a failure.
    #[error("import canceled")]
    Canceled,

    /// The bundle could not be decoded.
    #[error("bundle error: {0}")]
    Bundle(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} chunk exceeded its {secs}s transaction timeout")]
    Timeout { entity: EntityKind, secs: u64 },

    #[error("staging error: {0}")]
    Staging(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ImportError {
    pub fn config(message: impl Into<String>) -> Self {
        ImportError::Configuration(message.into())
    }

    pub fn staging(err: anyhow::Error) -> Self {
        ImportError::Staging(format!("{:#}", err))
    }
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;
