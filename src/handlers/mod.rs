//! HTTP handlers. Each one builds its clients, runs one operation, closes the
//! clients, and reduces any failure to a generic message.

pub mod customer_handlers;
pub mod health_handlers;
pub mod user_handlers;

use crate::{errors::AppError, services::error::ClientError};
use axum::response::IntoResponse;
use tracing::error;

/// Log `err` with context and hide it behind a generic 500 message.
pub(crate) fn internal(context: &str, err: ClientError, message: &'static str) -> AppError {
    error!(error = %err, "error {}", context);
    AppError::internal(message)
}

/// Fallback for unmatched routes.
pub async fn not_found() -> impl IntoResponse {
    AppError::not_found("Not Found")
}
