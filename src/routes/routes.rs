//! Defines the HTTP surface.
//!
//! ## Structure
//! - `GET  /health`              liveness, touches no database
//! - `GET  /users`               all users from the relational database
//! - `GET  /users/{id}`          one user, 404 when absent
//! - `GET  /customers`           customers from the warehouse
//! - `POST /transfer/customers`  copy warehouse customers into the relational `customers` table
//!
//! Every error body is `{"error": "<message>"}`, including unmatched routes and
//! panics.

use crate::{
    errors::AppError,
    handlers::{
        customer_handlers::{list_customers, transfer_customers},
        health_handlers::health,
        not_found,
        user_handlers::{get_user, list_users},
    },
    state::AppState,
};
use axum::{
    Router,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::any::Any;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

/// Build the route table. The router carries `AppState` to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/users", get(list_users))
        .route("/users/{id}", get(get_user))
        .route("/customers", get(list_customers))
        .route("/transfer/customers", post(transfer_customers))
        .fallback(not_found)
}

/// Attach request tracing and the panic-to-500 handler.
pub fn layered(router: Router<AppState>) -> Router<AppState> {
    router
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
}

/// The complete application, ready to serve.
pub fn app(state: AppState) -> Router {
    layered(routes()).with_state(state)
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    tracing::error!(detail, "internal server error");
    AppError::internal("Internal Server Error").into_response()
}
