//! The user row served by `/users`.

use crate::{
    models::record::Record,
    services::error::{ClientError, ClientResult},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user as returned by `get_all_users.sql` / `get_user_by_id.sql`.
///
/// Extra columns in the query result are ignored. Nullable columns map to
/// `null` rather than failing the row.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    /// ISO-8601 timestamp.
    pub created_at: Option<String>,
}

impl User {
    pub fn from_record(record: Record) -> ClientResult<Self> {
        serde_json::from_value(Value::Object(record)).map_err(|e| ClientError::Decode {
            column: "users".into(),
            reason: e.to_string(),
        })
    }
}
