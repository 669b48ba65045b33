//! Handlers for warehouse customers and the warehouse → relational transfer.

use crate::{
    errors::AppError,
    handlers::internal,
    models::record::Record,
    services::{
        backends::{RelationalStore, WarehouseStore},
        error::ClientResult,
    },
    state::AppState,
};
use axum::{Json, extract::State};
use serde::Serialize;
use tracing::info;

const CUSTOMERS_SQL: &str = "get_customers.sql";
const CUSTOMERS_SCHEMA_SQL: &str = "create_customers_table.sql";
const CUSTOMERS_TABLE: &str = "customers";

#[derive(Debug, Serialize)]
pub struct CustomersResponse {
    pub count: usize,
    pub customers: Vec<Record>,
}

#[derive(Debug, Serialize)]
pub struct TransferResponse {
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_transferred: Option<u64>,
}

/// `GET /customers`
pub async fn list_customers(
    State(state): State<AppState>,
) -> Result<Json<CustomersResponse>, AppError> {
    const FAILED: &str = "Failed to retrieve customers";

    let warehouse = state
        .backends
        .warehouse()
        .await
        .map_err(|e| internal("retrieving customers from warehouse", e, FAILED))?;
    let result = warehouse.query_from_file(CUSTOMERS_SQL).await;
    warehouse.close().await;

    let customers =
        result.map_err(|e| internal("retrieving customers from warehouse", e, FAILED))?;
    info!(count = customers.len(), "retrieved customers from warehouse");
    Ok(Json(CustomersResponse {
        count: customers.len(),
        customers,
    }))
}

/// `POST /transfer/customers`
///
/// Ensures the target table exists, reads every warehouse customer, and
/// inserts them into the relational `customers` table. Zero source rows is a
/// success that leaves the table untouched.
pub async fn transfer_customers(
    State(state): State<AppState>,
) -> Result<Json<TransferResponse>, AppError> {
    const FAILED: &str = "Failed to transfer customers data";

    let relational = state
        .backends
        .relational()
        .await
        .map_err(|e| internal("transferring customers data", e, FAILED))?;
    let warehouse = match state.backends.warehouse().await {
        Ok(warehouse) => warehouse,
        Err(e) => {
            relational.close().await;
            return Err(internal("transferring customers data", e, FAILED));
        }
    };

    let result = copy_customers(relational.as_ref(), warehouse.as_ref()).await;
    relational.close().await;
    warehouse.close().await;

    let transferred = result.map_err(|e| internal("transferring customers data", e, FAILED))?;
    let response = match transferred {
        None => TransferResponse {
            message: "No customers found to transfer",
            records_transferred: None,
        },
        Some(rows) => TransferResponse {
            message: "Transfer completed successfully",
            records_transferred: Some(rows),
        },
    };
    Ok(Json(response))
}

/// Returns `None` when the warehouse had nothing to copy.
async fn copy_customers(
    relational: &dyn RelationalStore,
    warehouse: &dyn WarehouseStore,
) -> ClientResult<Option<u64>> {
    relational.execute_schema(CUSTOMERS_SCHEMA_SQL).await?;

    let customers = warehouse.query_from_file(CUSTOMERS_SQL).await?;
    info!(count = customers.len(), "retrieved customers from warehouse");
    if customers.is_empty() {
        return Ok(None);
    }

    let rows = relational.write(CUSTOMERS_TABLE, &customers).await?;
    info!(rows, table = CUSTOMERS_TABLE, "transfer completed");
    Ok(Some(rows))
}
