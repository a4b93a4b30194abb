use thiserror::Error;

/// Errors raised by the detection and traversal engine.
///
/// Adapter errors (sqlx, reqwest) are folded into these variants at the
/// boundary so the controllers only reason about this taxonomy.
#[derive(Debug, Error)]
pub enum AmlError {
    /// The graph store could not be reached. Fatal to the current unit of work.
    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),

    /// Nothing could be fetched for an address. Treated as "nothing to analyze".
    #[error("ingestion failed for {address}: {reason}")]
    IngestionFailed { address: String, reason: String },

    /// One detector failed; the rest of the pipeline keeps going.
    #[error("detector {detector} failed: {reason}")]
    Detector { detector: String, reason: String },

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {job_id} already {status}")]
    JobAlreadyTerminal { job_id: String, status: String },

    /// Malformed input rejected before any work starts.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AmlError {
    /// Whether this error should end the whole job rather than skip one address.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for AmlError {
    fn from(e: sqlx::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for AmlError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AmlError>;
