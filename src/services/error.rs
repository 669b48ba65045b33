use gcp_bigquery_client::error::BQError;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Failures raised by the database clients. The HTTP layer is the only place
/// these are terminated.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection to `{target}` failed: {reason}")]
    Connection { target: String, reason: String },
    /// Credentials could not be read or were refused.
    #[error("credentials for `{target}` rejected: {reason}")]
    Auth { target: String, reason: String },
    #[error("`{0}` called before connect()")]
    State(&'static str),
    #[error("sql file `{}` not found", .0.display())]
    NotFound(PathBuf),
    #[error("sql file name `{0}` is not allowed")]
    InvalidFileName(String),
    #[error("write to `{table}` failed: {reason}")]
    Write { table: String, reason: String },
    #[error("cannot decode column `{column}`: {reason}")]
    Decode { column: String, reason: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Warehouse(#[from] BQError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn connection(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn write(table: impl Into<String>, reason: impl ToString) -> Self {
        Self::Write {
            table: table.into(),
            reason: reason.to_string(),
        }
    }

    pub fn auth(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Auth {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Warehouse(err) => is_transient_bq(err),
            _ => false,
        }
    }
}

/// BigQuery reasons that mean "try again later" regardless of status code.
const RETRYABLE_REASONS: [&str; 3] = ["rateLimitExceeded", "backendError", "internalError"];

/// Transport failures, throttling and server-side errors are transient.
/// Anything the request itself caused (bad SQL, missing table, bad
/// credentials) fails the same way on every attempt.
fn is_transient_bq(err: &BQError) -> bool {
    match err {
        BQError::RequestError(_) | BQError::TonicTransportError(_) => true,
        BQError::ResponseError { error } => {
            let nested = &error.error;
            nested.code == 429
                || nested.code >= 500
                || nested.errors.iter().any(|detail| {
                    detail
                        .get("reason")
                        .is_some_and(|r| RETRYABLE_REASONS.contains(&r.as_str()))
                })
        }
        _ => false,
    }
}
