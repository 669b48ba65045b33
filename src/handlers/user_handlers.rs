//! Handlers for users stored in the relational database.

use crate::{
    errors::AppError,
    handlers::internal,
    models::user::User,
    services::{backends::RelationalStore, error::ClientResult},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::Value;
use tracing::info;

const LIST_USERS_SQL: &str = "get_all_users.sql";
const GET_USER_SQL: &str = "get_user_by_id.sql";

/// `GET /users`
pub async fn list_users(State(state): State<AppState>) -> Result<Json<Vec<User>>, AppError> {
    const FAILED: &str = "Failed to retrieve users";

    let store = state
        .backends
        .relational()
        .await
        .map_err(|e| internal("retrieving users", e, FAILED))?;
    let result = fetch_users(store.as_ref()).await;
    store.close().await;

    let users = result.map_err(|e| internal("retrieving users", e, FAILED))?;
    info!(count = users.len(), "retrieved users");
    Ok(Json(users))
}

/// `GET /users/{id}`. 404 when the id is not an integer or no row matches.
pub async fn get_user(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<User>, AppError> {
    const FAILED: &str = "Failed to retrieve user";

    let Ok(user_id) = raw_id.parse::<i64>() else {
        return Err(AppError::not_found("User not found"));
    };

    let store = state
        .backends
        .relational()
        .await
        .map_err(|e| internal("retrieving user", e, FAILED))?;
    let result = fetch_user(store.as_ref(), user_id).await;
    store.close().await;

    match result.map_err(|e| internal("retrieving user", e, FAILED))? {
        Some(user) => {
            info!(user_id, "retrieved user");
            Ok(Json(user))
        }
        None => Err(AppError::not_found("User not found")),
    }
}

async fn fetch_users(store: &dyn RelationalStore) -> ClientResult<Vec<User>> {
    let sql = store.load_query(LIST_USERS_SQL).await?;
    store
        .fetch_all(&sql, &[])
        .await?
        .into_iter()
        .map(User::from_record)
        .collect()
}

async fn fetch_user(store: &dyn RelationalStore, user_id: i64) -> ClientResult<Option<User>> {
    let sql = store.load_query(GET_USER_SQL).await?;
    store
        .fetch_optional(&sql, &[Value::from(user_id)])
        .await?
        .map(User::from_record)
        .transpose()
}
