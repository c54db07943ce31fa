// SPDX-License-Identifier: Apache-2.0

//! Error types for BigQuery operations

use std::fmt;

use arrow_schema::ArrowError;
use thiserror::Error;

/// Result type for BigQuery operations
pub type BqResult<T> = Result<T, BqError>;

/// Errors that can occur when talking to BigQuery or assembling results
#[derive(Debug, Error)]
pub enum BqError {
    /// No usable credential source, or the selected source is unreadable
    #[error("credential error: {0}")]
    Credential(String),

    /// Access token could not be signed
    #[error("token signing error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    /// Dataset does not exist
    #[error("dataset {0} does not exist")]
    DatasetNotFound(String),

    /// Table does not exist
    #[error("table {dataset}:{table} does not exist")]
    TableNotFound { dataset: String, table: String },

    /// Table already exists
    #[error("table {dataset}:{table} already exists")]
    TableAlreadyExists { dataset: String, table: String },

    /// Error response returned by the BigQuery API
    #[error("BigQuery API error (HTTP {status}{}): {message}", reason_suffix(.reason))]
    Api {
        status: u16,
        reason: Option<String>,
        message: String,
    },

    /// Transport failure talking to the API
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Query or load job finished with an error result
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },

    /// Rows rejected by insertAll
    #[error("{} row(s) rejected by insertAll: {}", .0.len(), InsertErrorList(.0))]
    InsertFailed(Vec<RowInsertError>),

    /// Row batches disagree with the result shape
    #[error("data shape error: {0}")]
    DataShape(String),

    /// Warehouse column type the client cannot represent
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Arrow array construction error
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error
    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl BqError {
    pub(crate) fn data_shape(msg: impl Into<String>) -> Self {
        BqError::DataShape(msg.into())
    }

    /// Whether the error originated in the remote service
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            BqError::Api { .. }
                | BqError::Http(_)
                | BqError::JobFailed { .. }
                | BqError::InsertFailed(_)
        )
    }
}

/// One row rejected by insertAll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInsertError {
    /// Index of the row in the submitted request
    pub index: usize,
    /// Reasons reported for the row, as `reason: message`
    pub errors: Vec<String>,
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(", {r}"))
        .unwrap_or_default()
}

struct InsertErrorList<'a>(&'a [RowInsertError]);

impl fmt::Display for InsertErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "row {}: {}", err.index, err.errors.join(", "))?;
        }
        Ok(())
    }
}
