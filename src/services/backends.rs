//! The seam between HTTP handlers and the database clients.
//!
//! Handlers ask a [`Backends`] for a freshly connected client per request and
//! close it when done. [`LiveBackends`] builds real clients from the startup
//! configuration; tests substitute their own.

use crate::{
    config::AppConfig,
    models::record::Record,
    services::{
        connector::Connector,
        error::ClientResult,
        relational::RelationalClient,
        warehouse::WarehouseClient,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn load_query(&self, file: &str) -> ClientResult<String>;
    async fn fetch_all(&self, sql: &str, params: &[Value]) -> ClientResult<Vec<Record>>;
    async fn fetch_optional(&self, sql: &str, params: &[Value]) -> ClientResult<Option<Record>>;
    async fn write(&self, table: &str, records: &[Record]) -> ClientResult<u64>;
    async fn execute_schema(&self, file: &str) -> ClientResult<()>;
    async fn close(&self);
}

#[async_trait]
pub trait WarehouseStore: Send + Sync {
    async fn query_from_file(&self, file: &str) -> ClientResult<Vec<Record>>;
    async fn close(&self);
}

/// Produces connected clients. Each call yields a new, unshared client.
#[async_trait]
pub trait Backends: Send + Sync {
    async fn relational(&self) -> ClientResult<Box<dyn RelationalStore>>;
    async fn warehouse(&self) -> ClientResult<Box<dyn WarehouseStore>>;
}

#[async_trait]
impl RelationalStore for RelationalClient {
    async fn load_query(&self, file: &str) -> ClientResult<String> {
        RelationalClient::load_query(self, file).await
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> ClientResult<Vec<Record>> {
        RelationalClient::fetch_all(self, sql, params).await
    }

    async fn fetch_optional(&self, sql: &str, params: &[Value]) -> ClientResult<Option<Record>> {
        RelationalClient::fetch_optional(self, sql, params).await
    }

    async fn write(&self, table: &str, records: &[Record]) -> ClientResult<u64> {
        RelationalClient::write(self, table, records).await
    }

    async fn execute_schema(&self, file: &str) -> ClientResult<()> {
        RelationalClient::execute_schema(self, file).await
    }

    async fn close(&self) {
        RelationalClient::close(self).await
    }
}

#[async_trait]
impl WarehouseStore for WarehouseClient {
    async fn query_from_file(&self, file: &str) -> ClientResult<Vec<Record>> {
        WarehouseClient::query_from_file(self, file).await
    }

    async fn close(&self) {
        WarehouseClient::close(self).await
    }
}

/// Builds real clients from the startup configuration, one per call.
pub struct LiveBackends {
    config: Arc<AppConfig>,
    connector: Arc<dyn Connector>,
}

impl LiveBackends {
    pub fn new(config: Arc<AppConfig>, connector: Arc<dyn Connector>) -> Self {
        Self { config, connector }
    }
}

#[async_trait]
impl Backends for LiveBackends {
    async fn relational(&self) -> ClientResult<Box<dyn RelationalStore>> {
        let mut client = RelationalClient::new(
            self.config.relational.clone(),
            &self.config.sql_dir,
            self.connector.clone(),
        );
        if let Err(e) = client.connect().await {
            client.close().await;
            return Err(e);
        }
        Ok(Box::new(client))
    }

    async fn warehouse(&self) -> ClientResult<Box<dyn WarehouseStore>> {
        let client = WarehouseClient::new(self.config.warehouse.clone(), &self.config.sql_dir);
        client.connect().await?;
        Ok(Box::new(client))
    }
}
