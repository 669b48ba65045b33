//! RelationalClient, a pooled PostgreSQL-protocol client (AlloyDB, Cloud SQL,
//! plain Postgres) reached through a [`Connector`].
//!
//! One client lives for one request: `connect()`, a single operation, then
//! `close()`. Writes go through one multi-row `INSERT ... SELECT FROM
//! jsonb_populate_recordset(...)` so the server converts every JSON value to
//! the target column type.

use crate::{
    config::RelationalConfig,
    models::record::Record,
    services::{
        connector::Connector,
        error::{ClientError, ClientResult},
        sql_files::{Namespace, SqlFiles},
    },
};
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::{
    Column, Decode, PgPool, Postgres, Row, Type, TypeInfo,
    pool::PoolConnection,
    postgres::{PgArguments, PgPoolOptions, PgRow},
    query::Query,
    types::{
        Decimal, Json,
        chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc},
    },
};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_CONNECTIONS: u32 = 5;
/// Connections older than this are recycled.
const CONNECTION_MAX_LIFETIME: Duration = Duration::from_secs(300);
const MAX_IDENTIFIER_LEN: usize = 63;

pub struct RelationalClient {
    cfg: RelationalConfig,
    connector: Arc<dyn Connector>,
    files: SqlFiles,
    pool: Option<PgPool>,
}

impl RelationalClient {
    pub fn new(cfg: RelationalConfig, sql_dir: &Path, connector: Arc<dyn Connector>) -> Self {
        Self {
            cfg,
            connector,
            files: SqlFiles::new(sql_dir, Namespace::Relational),
            pool: None,
        }
    }

    /// Build the pool through the connector and validate it with `SELECT 1`.
    pub async fn connect(&mut self) -> ClientResult<()> {
        let target = self.cfg.instance.clone();
        info!(
            instance = %target,
            user = %self.cfg.user,
            db = %self.cfg.database,
            "connecting to relational database"
        );

        let options = self.connector.connect_options(&self.cfg).await.map_err(|e| {
            error!(instance = %target, error = %e, "connector failed");
            e
        })?;

        let pool = tokio::time::timeout(
            self.cfg.connect_timeout,
            PgPoolOptions::new()
                .max_connections(MAX_CONNECTIONS)
                .acquire_timeout(self.cfg.connect_timeout)
                .max_lifetime(CONNECTION_MAX_LIFETIME)
                .test_before_acquire(true)
                .connect_with(options),
        )
        .await
        .map_err(|_| ClientError::connection(&target, "timed out"))?
        .map_err(|e| {
            error!(instance = %target, error = %e, "failed to open relational pool");
            ClientError::connection(&target, e)
        })?;

        match sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
        {
            Ok(1) => {}
            Ok(v) => {
                pool.close().await;
                return Err(ClientError::connection(
                    &target,
                    format!("validation returned {}", v),
                ));
            }
            Err(e) => {
                pool.close().await;
                error!(instance = %target, error = %e, "connection test failed");
                return Err(ClientError::connection(&target, e));
            }
        }

        info!(instance = %target, "relational connection test successful");
        self.pool = Some(pool);
        Ok(())
    }

    fn pool(&self, op: &'static str) -> ClientResult<&PgPool> {
        self.pool.as_ref().ok_or(ClientError::State(op))
    }

    /// A pooled connection, returned to the pool when the guard drops.
    pub async fn connection(&self) -> ClientResult<PoolConnection<Postgres>> {
        Ok(self.pool("connection")?.acquire().await?)
    }

    /// Insert `records` into `table` with one statement and return the row count.
    ///
    /// Every record must carry exactly the first record's columns. Empty input
    /// is a no-op and does not require a connection.
    pub async fn write(&self, table: &str, records: &[Record]) -> ClientResult<u64> {
        if records.is_empty() {
            warn!(table, "no records to insert");
            return Ok(0);
        }

        let statement = insert_statement(table, records)?;
        let pool = self.pool("write")?;
        debug!(table, sql = %statement, "insert statement");

        let mut tx = pool.begin().await.map_err(|e| ClientError::write(table, e))?;
        match sqlx::query(&statement)
            .bind(Json(records))
            .execute(&mut *tx)
            .await
        {
            Ok(done) => {
                tx.commit().await.map_err(|e| ClientError::write(table, e))?;
                let rows = done.rows_affected();
                info!(table, rows, "inserted rows");
                Ok(rows)
            }
            Err(e) => {
                error!(table, error = %e, "error writing records");
                if let Err(rollback) = tx.rollback().await {
                    warn!(table, error = %rollback, "rollback failed");
                }
                Err(ClientError::write(table, e))
            }
        }
    }

    /// Execute every `;`-separated statement of a schema file in one transaction.
    pub async fn execute_schema(&self, file: &str) -> ClientResult<()> {
        let pool = self.pool("execute_schema")?;
        let statements = self.files.load_statements(file).await?;

        let mut tx = pool.begin().await?;
        for statement in &statements {
            debug!(file, sql = %statement, "executing schema statement");
            if let Err(e) = sqlx::query(statement).execute(&mut *tx).await {
                error!(file, error = %e, "error executing schema file");
                return Err(e.into());
            }
        }
        tx.commit().await?;

        info!(file, statements = statements.len(), "schema file executed");
        Ok(())
    }

    pub async fn load_query(&self, file: &str) -> ClientResult<String> {
        self.files.load(file).await.map_err(|e| {
            error!(file, error = %e, "error loading query file");
            e
        })
    }

    /// Run `sql` with positional binds and decode every row.
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> ClientResult<Vec<Record>> {
        let mut conn = self.connection().await?;
        let mut rows = bind_params(sqlx::query(sql), params).fetch(&mut *conn);

        let mut records = Vec::new();
        while let Some(row) = rows.try_next().await? {
            records.push(decode_row(&row)?);
        }
        debug!(rows = records.len(), "query returned rows");
        Ok(records)
    }

    /// Run `sql` with positional binds and decode at most one row.
    pub async fn fetch_optional(
        &self,
        sql: &str,
        params: &[Value],
    ) -> ClientResult<Option<Record>> {
        let mut conn = self.connection().await?;
        let row = bind_params(sqlx::query(sql), params)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Close the pool and the connector. Never fails; problems are logged.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        match self.connector.close().await {
            Ok(()) => info!("relational connections closed"),
            Err(e) => warn!(error = %e, "error closing relational connector"),
        }
    }
}

/// `INSERT INTO t (cols) SELECT cols FROM jsonb_populate_recordset(NULL::t, $1)`.
///
/// Validates the table name, every column name, and that all records share
/// one column set.
pub fn insert_statement(table: &str, records: &[Record]) -> ClientResult<String> {
    let table_sql =
        quote_table(table).ok_or_else(|| ClientError::write(table, "invalid table name"))?;

    let first = records
        .first()
        .ok_or_else(|| ClientError::write(table, "no records"))?;
    if first.is_empty() {
        return Err(ClientError::write(table, "records have no columns"));
    }

    let mut columns = Vec::with_capacity(first.len());
    for name in first.keys() {
        let quoted = quote_ident(name).ok_or_else(|| {
            ClientError::write(table, format!("invalid column name `{}`", name))
        })?;
        columns.push(quoted);
    }

    if let Some(pos) = records
        .iter()
        .position(|r| r.len() != first.len() || !first.keys().all(|k| r.contains_key(k)))
    {
        return Err(ClientError::write(
            table,
            format!("record {} has a different column set than record 0", pos),
        ));
    }

    let column_list = columns.join(", ");
    Ok(format!(
        "INSERT INTO {table} ({cols}) SELECT {cols} FROM jsonb_populate_recordset(NULL::{table}, $1)",
        table = table_sql,
        cols = column_list
    ))
}

/// Quote a plain identifier. Only `[A-Za-z_][A-Za-z0-9_$]*` is accepted.
fn quote_ident(name: &str) -> Option<String> {
    let mut chars = name.chars();
    let first = chars.next()?;
    let valid = name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    valid.then(|| format!("\"{}\"", name))
}

/// Quote `table` or `schema.table`.
fn quote_table(table: &str) -> Option<String> {
    match table.split_once('.') {
        Some((schema, name)) => Some(format!(
            "{}.{}",
            quote_ident(schema)?,
            quote_ident(name)?
        )),
        None => quote_ident(table),
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            other => query.bind(Json(other)),
        };
    }
    query
}

fn column_value<'r, T>(row: &'r PgRow, idx: usize, name: &str) -> ClientResult<Option<T>>
where
    T: Decode<'r, Postgres> + Type<Postgres>,
{
    row.try_get::<Option<T>, _>(idx)
        .map_err(|e| ClientError::Decode {
            column: name.to_string(),
            reason: e.to_string(),
        })
}

/// Decode a row into a [`Record`] by column type. `NUMERIC` comes back as its
/// decimal string. Unsupported types are an error rather than a silent null;
/// cast them in SQL (`::text`).
pub fn decode_row(row: &PgRow) -> ClientResult<Record> {
    let mut record = Record::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let type_name = column.type_info().name();

        let value = match type_name {
            "BOOL" => column_value::<bool>(row, idx, name)?.map(Value::from),
            "INT2" => column_value::<i16>(row, idx, name)?.map(Value::from),
            "INT4" => column_value::<i32>(row, idx, name)?.map(Value::from),
            "INT8" => column_value::<i64>(row, idx, name)?.map(Value::from),
            "FLOAT4" => {
                column_value::<f32>(row, idx, name)?.map(|v| Value::from(f64::from(v)))
            }
            "FLOAT8" => column_value::<f64>(row, idx, name)?.map(Value::from),
            // as a string so no precision is lost
            "NUMERIC" => {
                column_value::<Decimal>(row, idx, name)?.map(|v| Value::from(v.to_string()))
            }
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
                column_value::<String>(row, idx, name)?.map(Value::from)
            }
            "JSON" | "JSONB" => column_value::<Value>(row, idx, name)?,
            "UUID" => {
                column_value::<Uuid>(row, idx, name)?.map(|v| Value::from(v.to_string()))
            }
            "TIMESTAMPTZ" => column_value::<DateTime<Utc>>(row, idx, name)?
                .map(|v| Value::from(v.to_rfc3339())),
            "TIMESTAMP" => column_value::<NaiveDateTime>(row, idx, name)?
                .map(|v| Value::from(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
            "DATE" => {
                column_value::<NaiveDate>(row, idx, name)?.map(|v| Value::from(v.to_string()))
            }
            "TIME" => {
                column_value::<NaiveTime>(row, idx, name)?.map(|v| Value::from(v.to_string()))
            }
            other => {
                return Err(ClientError::Decode {
                    column: name.to_string(),
                    reason: format!("unsupported column type {}", other),
                });
            }
        };

        record.insert(name.to_string(), value.unwrap_or(Value::Null));
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RelationalConfig, Secret},
        models::record::record,
        services::connector::SecureConnector,
    };
    use serde_json::json;
    use sqlx::postgres::PgConnectOptions;
    use std::str::FromStr;

    fn unconnected() -> RelationalClient {
        let cfg = RelationalConfig {
            instance: "127.0.0.1:1".into(),
            user: "app".into(),
            password: Secret::new("pw"),
            database: "sample_db".into(),
            ssl_mode: "disable".into(),
            connect_timeout: Duration::from_millis(500),
        };
        RelationalClient::new(cfg, Path::new("sql"), Arc::new(SecureConnector))
    }

    fn customer(id: i64, name: &str) -> Record {
        record([("customer_id", json!(id)), ("name", json!(name))])
    }

    #[test]
    fn insert_statement_is_one_multi_row_statement() {
        let sql = insert_statement("customers", &[customer(1, "a"), customer(2, "b")]).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"customers\" (\"customer_id\", \"name\") SELECT \"customer_id\", \"name\" \
             FROM jsonb_populate_recordset(NULL::\"customers\", $1)"
        );
    }

    #[test]
    fn schema_qualified_table_is_quoted_per_part() {
        let sql = insert_statement("crm.customers", &[customer(1, "a")]).unwrap();
        assert!(sql.starts_with("INSERT INTO \"crm\".\"customers\" "));
        assert!(sql.ends_with("NULL::\"crm\".\"customers\", $1)"));
    }

    #[test]
    fn heterogeneous_records_are_rejected() {
        let odd = record([("customer_id", json!(3)), ("email", json!("c@x.io"))]);
        let err = insert_statement("customers", &[customer(1, "a"), odd]).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Write { ref reason, .. } if reason.contains("record 1")
        ));

        let wider = record([
            ("customer_id", json!(3)),
            ("name", json!("c")),
            ("email", json!("c@x.io")),
        ]);
        assert!(insert_statement("customers", &[customer(1, "a"), wider]).is_err());
    }

    #[test]
    fn key_order_does_not_matter_between_records() {
        let reordered = record([("name", json!("b")), ("customer_id", json!(2))]);
        assert!(insert_statement("customers", &[customer(1, "a"), reordered]).is_ok());
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        assert!(insert_statement("customers; DROP TABLE x", &[customer(1, "a")]).is_err());
        assert!(insert_statement("a.b.c", &[customer(1, "a")]).is_err());
        let evil = record([("name\"); --", json!(1))]);
        assert!(insert_statement("customers", &[evil]).is_err());
        assert!(insert_statement("customers", &[Record::new()]).is_err());
    }

    #[tokio::test]
    async fn empty_write_is_a_noop_even_unconnected() {
        let client = unconnected();
        assert_eq!(client.write("customers", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn operations_before_connect_are_state_errors() {
        let client = unconnected();
        assert!(client.pool.is_none());
        assert!(matches!(
            client.connection().await,
            Err(ClientError::State("connection"))
        ));
        assert!(matches!(
            client.write("customers", &[customer(1, "a")]).await,
            Err(ClientError::State("write"))
        ));
        assert!(matches!(
            client.fetch_all("SELECT 1", &[]).await,
            Err(ClientError::State(_))
        ));
        assert!(matches!(
            client.execute_schema("create_customers_table.sql").await,
            Err(ClientError::State("execute_schema"))
        ));
        client.close().await;
    }

    #[tokio::test]
    async fn unreachable_instance_is_a_connection_error() {
        let mut client = unconnected();
        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection { ref target, .. } if target == "127.0.0.1:1"
        ));
        assert!(client.pool.is_none());
    }

    /// Connects straight to `TEST_DATABASE_URL`.
    struct UrlConnector(String);

    #[async_trait::async_trait]
    impl Connector for UrlConnector {
        async fn connect_options(&self, _: &RelationalConfig) -> ClientResult<PgConnectOptions> {
            PgConnectOptions::from_str(&self.0).map_err(|e| ClientError::connection("test", e))
        }
    }

    async fn live_client() -> RelationalClient {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL");
        let mut cfg = unconnected().cfg;
        cfg.connect_timeout = Duration::from_secs(10);
        let mut client =
            RelationalClient::new(cfg, Path::new("sql"), Arc::new(UrlConnector(url)));
        client.connect().await.expect("connect");
        client
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL"]
    async fn write_round_trips_every_row() {
        let client = live_client().await;
        let table = format!("write_rt_{}", Uuid::new_v4().simple());
        {
            let mut conn = client.connection().await.unwrap();
            sqlx::query(&format!(
                "CREATE TABLE {} \
                 (customer_id BIGINT, name TEXT, joined TIMESTAMPTZ, balance NUMERIC(20, 6))",
                table
            ))
            .execute(&mut *conn)
            .await
            .unwrap();
        }

        let rows = vec![
            record([
                ("customer_id", json!("1")),
                ("name", json!("Ada")),
                ("joined", json!("2024-01-02T03:04:05+00:00")),
                ("balance", json!("12345678901234.500001")),
            ]),
            record([
                ("customer_id", json!(2)),
                ("name", Value::Null),
                ("joined", Value::Null),
                ("balance", Value::Null),
            ]),
        ];
        assert_eq!(client.write(&table, &rows).await.unwrap(), 2);

        let stored = client
            .fetch_all(
                &format!(
                    "SELECT customer_id, name, joined, balance FROM {} ORDER BY customer_id",
                    table
                ),
                &[],
            )
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0]["customer_id"], json!(1));
        assert_eq!(stored[0]["name"], json!("Ada"));
        assert_eq!(stored[0]["joined"], json!("2024-01-02T03:04:05+00:00"));
        assert_eq!(stored[0]["balance"], json!("12345678901234.500001"));
        assert_eq!(stored[1]["name"], Value::Null);
        assert_eq!(stored[1]["balance"], Value::Null);

        let one = client
            .fetch_optional(
                &format!("SELECT name FROM {} WHERE customer_id = $1", table),
                &[json!(1)],
            )
            .await
            .unwrap();
        assert_eq!(one, Some(record([("name", json!("Ada"))])));

        let mut conn = client.connection().await.unwrap();
        sqlx::query(&format!("DROP TABLE {}", table))
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);
        client.close().await;
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL"]
    async fn failed_insert_leaves_table_untouched() {
        let client = live_client().await;
        let table = format!("write_fail_{}", Uuid::new_v4().simple());
        {
            let mut conn = client.connection().await.unwrap();
            sqlx::query(&format!("CREATE TABLE {} (customer_id BIGINT NOT NULL)", table))
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        let rows = vec![
            record([("customer_id", json!(1))]),
            record([("customer_id", Value::Null)]),
        ];
        assert!(matches!(
            client.write(&table, &rows).await,
            Err(ClientError::Write { .. })
        ));

        let count = client
            .fetch_all(&format!("SELECT count(*) AS n FROM {}", table), &[])
            .await
            .unwrap();
        assert_eq!(count[0]["n"], json!(0));

        let mut conn = client.connection().await.unwrap();
        sqlx::query(&format!("DROP TABLE {}", table))
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);
        client.close().await;
    }
}
