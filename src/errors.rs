//! The HTTP error envelope.
//!
//! Every non-2xx response, including unmatched routes and panics, carries
//! `{"error": "<message>"}`. The message is a fixed string chosen by the
//! handler, so client errors never leak driver or SDK detail to callers.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppError {
    pub status: StatusCode,
    pub message: &'static str,
}

#[derive(Serialize)]
struct Envelope {
    error: &'static str,
}

impl AppError {
    /// 500 with a generic message; the cause is logged by the caller.
    pub fn internal(message: &'static str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }

    pub fn not_found(message: &'static str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Envelope {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
