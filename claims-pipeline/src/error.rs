//! Error types for the claims pipeline.
//!
//! One enum covers the whole taxonomy. The two outcomes that are *not*
//! errors get no variant on purpose: a failed author-position match is a
//! plain `None` from the matcher, and a blacklisted/postponed identity is
//! an early `Ok` in the enrichment stage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker or remote registry unreachable. The current operation is
    /// aborted without mutating state; the next cycle retries.
    #[error("connection error: {0}")]
    Connection(String),

    /// Unexpected shape in a registry profile, work item or message body.
    /// The offending unit is skipped; surrounding batch processing continues.
    #[error("malformed data at {path}: {detail}")]
    MalformedData { path: String, detail: String },

    /// Message is neither the expected object nor list shape.
    #[error("unknown payload: {0}")]
    UnknownPayload(String),

    /// Durable-store failure on read or write.
    #[error("store error: {0}")]
    Store(String),

    /// No author position cleared the similarity threshold for a claim
    /// that a stage required to match.
    #[error("no author position matched for {identity_id} on {document_id}")]
    NoMatch {
        document_id: String,
        identity_id: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        PipelineError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        PipelineError::Connection(e.to_string())
    }
}

impl PipelineError {
    /// Failures local to one unit of work (one profile, one work item)
    /// never abort the surrounding batch.
    pub fn is_unit_local(&self) -> bool {
        matches!(self, PipelineError::MalformedData { .. })
    }

    pub fn malformed(path: impl Into<String>, detail: impl Into<String>) -> Self {
        PipelineError::MalformedData {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
