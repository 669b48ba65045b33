//! WarehouseClient: runs analytic queries against BigQuery.
//!
//! The SDK client is created lazily on first use. Every query call runs under
//! a bounded [`RetryPolicy`]; a retry re-submits the whole query.

use crate::{
    config::WarehouseConfig,
    models::record::Record,
    services::{
        error::{ClientError, ClientResult},
        retry::{RetryPolicy, with_retry},
        sql_files::{Namespace, SqlFiles},
    },
};
use async_trait::async_trait;
use chrono::DateTime;
use gcp_bigquery_client::{
    Client,
    model::{
        field_type::FieldType, get_query_results_parameters::GetQueryResultsParameters,
        job_reference::JobReference, query_request::QueryRequest,
        table_field_schema::TableFieldSchema, table_row::TableRow, table_schema::TableSchema,
    },
};
use serde_json::{Map, Value};
use std::{path::Path, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// How long one BigQuery call waits server-side for the job before returning.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// How a result column's raw (string-encoded) values are converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    /// Epoch seconds, rendered as RFC 3339.
    Timestamp,
    /// Nested columns, rendered as an object keyed by sub-column name.
    Record,
    /// Passed through unchanged.
    Other,
}

impl From<&FieldType> for ColumnKind {
    fn from(field_type: &FieldType) -> Self {
        match field_type {
            FieldType::Integer | FieldType::Int64 => ColumnKind::Integer,
            FieldType::Float | FieldType::Float64 => ColumnKind::Float,
            FieldType::Boolean | FieldType::Bool => ColumnKind::Boolean,
            FieldType::Timestamp => ColumnKind::Timestamp,
            FieldType::Record | FieldType::Struct => ColumnKind::Record,
            _ => ColumnKind::Other,
        }
    }
}

/// A result column as described by the query schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    /// `REPEATED` mode: the cell is an array of values.
    pub repeated: bool,
    /// Sub-columns of a [`ColumnKind::Record`].
    pub fields: Vec<Column>,
}

impl From<&TableFieldSchema> for Column {
    fn from(field: &TableFieldSchema) -> Self {
        Self {
            name: field.name.clone(),
            kind: ColumnKind::from(&field.r#type),
            repeated: field
                .mode
                .as_deref()
                .is_some_and(|mode| mode.eq_ignore_ascii_case("REPEATED")),
            fields: field
                .fields
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(Column::from)
                .collect(),
        }
    }
}

/// One response, from either the initial query or a follow-up fetch.
struct Page {
    complete: bool,
    schema: Option<TableSchema>,
    rows: Option<Vec<TableRow>>,
    page_token: Option<String>,
    job: Option<JobReference>,
}

/// The two jobs API calls a query needs.
#[async_trait]
trait ResultSource: Send + Sync {
    /// Submit the query and return the first response.
    async fn submit(&self, sql: &str) -> ClientResult<Page>;

    /// Wait for or page through the job's results. `page_token` is `None`
    /// while the job is still running.
    async fn fetch(&self, job: &JobReference, page_token: Option<String>) -> ClientResult<Page>;
}

struct JobsApi<'a> {
    client: &'a Client,
    project: &'a str,
}

#[async_trait]
impl<'a> ResultSource for JobsApi<'a> {
    async fn submit(&self, sql: &str) -> ClientResult<Page> {
        let mut request = QueryRequest::new(sql);
        request.timeout_ms = Some(POLL_TIMEOUT_MS);
        let response = self.client.job().query(self.project, request).await?;
        Ok(Page {
            complete: response.job_complete.unwrap_or(false),
            schema: response.schema,
            rows: response.rows,
            page_token: response.page_token,
            job: response.job_reference,
        })
    }

    async fn fetch(&self, job: &JobReference, page_token: Option<String>) -> ClientResult<Page> {
        let job_id = job.job_id.as_deref().ok_or_else(|| {
            ClientError::connection(self.project, "query response has no job id")
        })?;
        debug!(job_id, has_token = page_token.is_some(), "fetching query results");

        let params = GetQueryResultsParameters {
            page_token,
            location: job.location.clone(),
            timeout_ms: Some(POLL_TIMEOUT_MS),
            ..Default::default()
        };
        let response = self
            .client
            .job()
            .get_query_results(self.project, job_id, params)
            .await?;
        Ok(Page {
            complete: response.job_complete.unwrap_or(false),
            schema: response.schema,
            rows: response.rows,
            page_token: response.page_token,
            job: response.job_reference,
        })
    }
}

pub struct WarehouseClient {
    cfg: WarehouseConfig,
    files: SqlFiles,
    retry: RetryPolicy,
    client: Mutex<Option<Arc<Client>>>,
}

impl WarehouseClient {
    pub fn new(cfg: WarehouseConfig, sql_dir: &Path) -> Self {
        let retry = RetryPolicy::exponential(cfg.max_retries, cfg.retry_initial_backoff);
        Self {
            cfg,
            files: SqlFiles::new(sql_dir, Namespace::Warehouse),
            retry,
            client: Mutex::new(None),
        }
    }

    /// Build the SDK client if it does not exist yet.
    pub async fn connect(&self) -> ClientResult<()> {
        self.handle().await.map(|_| ())
    }

    /// Credential failures are [`ClientError::Auth`] and never retried.
    async fn handle(&self) -> ClientResult<Arc<Client>> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        info!(project = %self.cfg.project_id, "connecting to warehouse");
        let built = match &self.cfg.credentials_file {
            Some(path) => Client::from_service_account_key_file(&path.to_string_lossy()).await,
            None => Client::from_application_default_credentials().await,
        };
        let client = Arc::new(built.map_err(|e| {
            error!(
                project = %self.cfg.project_id,
                error = %e,
                "failed to build warehouse credentials"
            );
            ClientError::auth(&self.cfg.project_id, e)
        })?);

        info!(project = %self.cfg.project_id, "warehouse connection established");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Run `sql` and return every result row, retrying transient failures.
    pub async fn query(&self, sql: &str) -> ClientResult<Vec<Record>> {
        with_retry(&self.retry, "warehouse query", || self.run_query(sql))
            .await
            .map_err(|e| {
                error!(
                    project = %self.cfg.project_id,
                    error = %e,
                    "error executing warehouse query"
                );
                e
            })
    }

    async fn run_query(&self, sql: &str) -> ClientResult<Vec<Record>> {
        let client = self.handle().await?;
        let project = self.cfg.project_id.as_str();

        info!(project, "executing warehouse query");
        debug!(sql, "warehouse query text");

        let api = JobsApi {
            client: client.as_ref(),
            project,
        };
        let records = collect_results(&api, sql).await?;

        info!(project, rows = records.len(), "retrieved records from warehouse");
        Ok(records)
    }

    pub async fn load_query(&self, file: &str) -> ClientResult<String> {
        self.files.load(file).await.map_err(|e| {
            error!(file, error = %e, "error loading query file");
            e
        })
    }

    pub async fn query_from_file(&self, file: &str) -> ClientResult<Vec<Record>> {
        let sql = self.load_query(file).await?;
        self.query(&sql).await
    }

    /// Drop the SDK client. Never fails.
    pub async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            info!(project = %self.cfg.project_id, "warehouse connection closed");
        }
    }
}

/// Submit `sql`, poll until the job completes, then follow page tokens until
/// the last page. Only the first complete response is guaranteed to carry the
/// schema; later pages reuse it.
async fn collect_results(source: &dyn ResultSource, sql: &str) -> ClientResult<Vec<Record>> {
    let mut page = source.submit(sql).await?;
    let job = page.job.take();

    let mut columns: Vec<Column> = Vec::new();
    let mut records = Vec::new();
    loop {
        if page.complete {
            if let Some(schema) = &page.schema {
                columns = schema_columns(schema);
            }
            let rows = row_cells(page.rows.take().unwrap_or_default());
            records.extend(decode_rows(&columns, rows)?);
            if page.page_token.is_none() {
                break;
            }
        }

        let job = job
            .as_ref()
            .ok_or_else(|| ClientError::connection("warehouse", "query response has no job"))?;
        let page_token = if page.complete {
            page.page_token.take()
        } else {
            None
        };
        page = source.fetch(job, page_token).await?;
    }

    Ok(records)
}

fn schema_columns(schema: &TableSchema) -> Vec<Column> {
    schema
        .fields
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(Column::from)
        .collect()
}

fn row_cells(rows: Vec<TableRow>) -> Vec<Vec<Option<Value>>> {
    rows.into_iter()
        .map(|row| {
            row.columns
                .unwrap_or_default()
                .into_iter()
                .map(|cell| cell.value)
                .collect()
        })
        .collect()
}

/// Turn raw result cells into records using the result columns.
pub fn decode_rows(
    columns: &[Column],
    rows: Vec<Vec<Option<Value>>>,
) -> ClientResult<Vec<Record>> {
    rows.into_iter()
        .map(|cells| {
            if cells.len() != columns.len() {
                return Err(ClientError::Decode {
                    column: "*".into(),
                    reason: format!(
                        "row has {} cells for {} columns",
                        cells.len(),
                        columns.len()
                    ),
                });
            }
            columns
                .iter()
                .zip(cells)
                .map(|(column, cell)| decode_cell(column, cell).map(|v| (column.name.clone(), v)))
                .collect::<ClientResult<Record>>()
        })
        .collect()
}

/// The API wraps every nested value as `{"v": value}`.
fn unwrap_v(item: Value) -> Option<Value> {
    match item {
        Value::Object(mut wrapper) if wrapper.contains_key("v") => wrapper.remove("v"),
        other => Some(other),
    }
}

fn decode_cell(column: &Column, cell: Option<Value>) -> ClientResult<Value> {
    match cell {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::Array(items)) if column.repeated => items
            .into_iter()
            .map(|item| decode_value(column, unwrap_v(item)))
            .collect::<ClientResult<Vec<_>>>()
            .map(Value::Array),
        Some(value) => decode_value(column, Some(value)),
    }
}

/// Decode a single (non-repeated) value of `column`.
fn decode_value(column: &Column, value: Option<Value>) -> ClientResult<Value> {
    let value = match value {
        None | Some(Value::Null) => return Ok(Value::Null),
        Some(value) => value,
    };

    if column.kind == ColumnKind::Record {
        return decode_struct(column, value);
    }
    match value {
        Value::String(raw) => decode_scalar(&column.name, column.kind, raw),
        other => Ok(other),
    }
}

/// `{"f": [{"v": ..}, ..]}` to an object keyed by sub-column name.
fn decode_struct(column: &Column, value: Value) -> ClientResult<Value> {
    let bad = |reason: &str| ClientError::Decode {
        column: column.name.clone(),
        reason: reason.to_string(),
    };

    let cells = match value {
        Value::Object(mut wrapper) => match wrapper.remove("f") {
            Some(Value::Array(cells)) => cells,
            _ => return Err(bad("record value has no `f` array")),
        },
        _ => return Err(bad("record value is not an object")),
    };
    if cells.len() != column.fields.len() {
        return Err(bad(&format!(
            "record has {} cells for {} fields",
            cells.len(),
            column.fields.len()
        )));
    }

    let mut object = Map::with_capacity(cells.len());
    for (field, cell) in column.fields.iter().zip(cells) {
        object.insert(field.name.clone(), decode_cell(field, unwrap_v(cell))?);
    }
    Ok(Value::Object(object))
}

fn decode_scalar(name: &str, kind: ColumnKind, raw: String) -> ClientResult<Value> {
    let bad = |reason: String| ClientError::Decode {
        column: name.to_string(),
        reason,
    };

    Ok(match kind {
        ColumnKind::Integer => Value::from(
            raw.parse::<i64>()
                .map_err(|e| bad(format!("`{}` is not an integer: {}", raw, e)))?,
        ),
        ColumnKind::Float => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Value::from(v),
            // NaN / Infinity have no JSON number form
            Ok(_) => Value::String(raw),
            Err(e) => return Err(bad(format!("`{}` is not a float: {}", raw, e))),
        },
        ColumnKind::Boolean => match raw.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(bad(format!("`{}` is not a boolean", raw))),
        },
        ColumnKind::Timestamp => {
            let secs = raw
                .parse::<f64>()
                .map_err(|e| bad(format!("`{}` is not an epoch timestamp: {}", raw, e)))?;
            let micros = (secs * 1_000_000.0).round() as i64;
            let ts = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| bad(format!("`{}` is out of range", raw)))?;
            Value::String(ts.to_rfc3339())
        }
        ColumnKind::Record | ColumnKind::Other => Value::String(raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcp_bigquery_client::model::table_cell::TableCell;
    use serde_json::json;
    use std::{collections::VecDeque, sync::Mutex as StdMutex, time::Duration};

    fn col(name: &str, kind: ColumnKind) -> Column {
        Column {
            name: name.into(),
            kind,
            repeated: false,
            fields: Vec::new(),
        }
    }

    fn columns() -> Vec<Column> {
        vec![
            col("customer_id", ColumnKind::Integer),
            col("name", ColumnKind::Other),
            col("balance", ColumnKind::Float),
            col("active", ColumnKind::Boolean),
            col("created_at", ColumnKind::Timestamp),
        ]
    }

    #[test]
    fn cells_are_typed_by_schema() {
        let rows = vec![vec![
            Some(json!("42")),
            Some(json!("Ada")),
            Some(json!("10.5")),
            Some(json!("true")),
            Some(json!("1.7041646450E9")),
        ]];
        let records = decode_rows(&columns(), rows).unwrap();

        assert_eq!(
            Value::Object(records[0].clone()),
            json!({
                "customer_id": 42,
                "name": "Ada",
                "balance": 10.5,
                "active": true,
                "created_at": "2024-01-02T03:04:05+00:00"
            })
        );
        let keys: Vec<&str> = records[0].keys().map(String::as_str).collect();
        assert_eq!(keys, ["customer_id", "name", "balance", "active", "created_at"]);
    }

    #[test]
    fn nulls_and_missing_cells_become_null() {
        let rows = vec![vec![Some(json!("1")), None, Some(Value::Null), None, None]];
        let records = decode_rows(&columns(), rows).unwrap();
        assert_eq!(records[0]["name"], Value::Null);
        assert_eq!(records[0]["balance"], Value::Null);
        assert_eq!(records[0]["created_at"], Value::Null);
    }

    #[test]
    fn fractional_timestamps_keep_microseconds() {
        let ts = col("ts", ColumnKind::Timestamp);
        let value = decode_cell(&ts, Some(json!("1704164645.123456"))).unwrap();
        assert_eq!(value, json!("2024-01-02T03:04:05.123456+00:00"));
    }

    #[test]
    fn non_finite_floats_stay_strings() {
        let value = decode_cell(&col("f", ColumnKind::Float), Some(json!("NaN"))).unwrap();
        assert_eq!(value, json!("NaN"));
    }

    #[test]
    fn malformed_cells_are_decode_errors() {
        assert!(matches!(
            decode_cell(&col("id", ColumnKind::Integer), Some(json!("4x"))),
            Err(ClientError::Decode { ref column, .. }) if column == "id"
        ));
        assert!(decode_cell(&col("ok", ColumnKind::Boolean), Some(json!("maybe"))).is_err());
        assert!(decode_rows(&columns(), vec![vec![Some(json!("1"))]]).is_err());
    }

    #[test]
    fn repeated_and_record_cells_are_unwrapped() {
        let tags = Column {
            repeated: true,
            ..col("tags", ColumnKind::Integer)
        };
        let value = decode_cell(&tags, Some(json!([{ "v": "1" }, { "v": "2" }]))).unwrap();
        assert_eq!(value, json!([1, 2]));

        let address = Column {
            fields: vec![
                col("city", ColumnKind::Other),
                Column {
                    repeated: true,
                    ..col("zips", ColumnKind::Other)
                },
            ],
            ..col("address", ColumnKind::Record)
        };
        let raw = json!({ "f": [{ "v": "Oslo" }, { "v": [{ "v": "0150" }] }] });
        assert_eq!(
            decode_cell(&address, Some(raw)).unwrap(),
            json!({ "city": "Oslo", "zips": ["0150"] })
        );

        let history = Column {
            repeated: true,
            ..address.clone()
        };
        let raw = json!([
            { "v": { "f": [{ "v": "Oslo" }, { "v": [] }] } },
            { "v": { "f": [{ "v": null }, { "v": null }] } }
        ]);
        assert_eq!(
            decode_cell(&history, Some(raw)).unwrap(),
            json!([{ "city": "Oslo", "zips": [] }, { "city": null, "zips": null }])
        );

        assert!(decode_cell(&address, Some(json!("Oslo"))).is_err());
    }

    #[test]
    fn nested_schema_becomes_nested_columns() {
        let field = TableFieldSchema::record(
            "address",
            vec![
                TableFieldSchema::string("city"),
                TableFieldSchema {
                    mode: Some("REPEATED".into()),
                    ..TableFieldSchema::integer("zips")
                },
            ],
        );
        let column = Column::from(&field);
        assert_eq!(column.kind, ColumnKind::Record);
        assert!(!column.repeated);
        assert_eq!(column.fields[0], col("city", ColumnKind::Other));
        assert!(column.fields[1].repeated);
        assert_eq!(column.fields[1].kind, ColumnKind::Integer);
    }

    /// Replays canned responses and records every fetch's page token.
    #[derive(Default)]
    struct ScriptedSource {
        pages: StdMutex<VecDeque<Page>>,
        fetched: StdMutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Page>) -> Self {
            Self {
                pages: StdMutex::new(pages.into()),
                fetched: StdMutex::default(),
            }
        }

        fn next(&self) -> ClientResult<Page> {
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(ClientError::State("fetch"))
        }
    }

    #[async_trait]
    impl ResultSource for ScriptedSource {
        async fn submit(&self, _sql: &str) -> ClientResult<Page> {
            self.next()
        }

        async fn fetch(&self, job: &JobReference, page_token: Option<String>) -> ClientResult<Page> {
            assert_eq!(job.job_id.as_deref(), Some("job-1"));
            self.fetched.lock().unwrap().push(page_token);
            self.next()
        }
    }

    fn customers_schema() -> TableSchema {
        TableSchema::new(vec![
            TableFieldSchema::integer("customer_id"),
            TableFieldSchema::timestamp("created_at"),
        ])
    }

    fn page(complete: bool, schema: Option<TableSchema>, ids: &[i64], token: Option<&str>) -> Page {
        let rows = ids
            .iter()
            .map(|id| TableRow {
                columns: Some(vec![
                    TableCell {
                        value: Some(json!(id.to_string())),
                    },
                    TableCell {
                        value: Some(json!("1704164645")),
                    },
                ]),
            })
            .collect::<Vec<_>>();
        Page {
            complete,
            schema,
            rows: (!rows.is_empty()).then_some(rows),
            page_token: token.map(str::to_string),
            job: Some(JobReference {
                job_id: Some("job-1".into()),
                ..Default::default()
            }),
        }
    }

    fn ids(records: &[Record]) -> Vec<Value> {
        records.iter().map(|r| r["customer_id"].clone()).collect()
    }

    #[tokio::test]
    async fn incomplete_job_is_polled_until_complete() {
        let source = ScriptedSource::new(vec![
            page(false, None, &[], None),
            page(false, None, &[], None),
            page(true, Some(customers_schema()), &[1, 2], None),
        ]);

        let records = collect_results(&source, "SELECT 1").await.unwrap();

        assert_eq!(ids(&records), [json!(1), json!(2)]);
        assert_eq!(*source.fetched.lock().unwrap(), vec![None, None]);
    }

    #[tokio::test]
    async fn pages_are_concatenated_in_order() {
        let source = ScriptedSource::new(vec![
            page(true, Some(customers_schema()), &[1, 2], Some("p2")),
            page(true, Some(customers_schema()), &[3], Some("p3")),
            page(true, Some(customers_schema()), &[4, 5], None),
        ]);

        let records = collect_results(&source, "SELECT 1").await.unwrap();

        assert_eq!(ids(&records), [json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(
            *source.fetched.lock().unwrap(),
            vec![Some("p2".to_string()), Some("p3".to_string())]
        );
    }

    #[tokio::test]
    async fn later_pages_reuse_the_first_schema() {
        let source = ScriptedSource::new(vec![
            page(true, Some(customers_schema()), &[1], Some("p2")),
            page(true, None, &[2], None),
        ]);

        let records = collect_results(&source, "SELECT 1").await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["customer_id"], json!(2));
        assert_eq!(records[1]["created_at"], json!("2024-01-02T03:04:05+00:00"));
    }

    #[tokio::test]
    async fn more_pages_without_a_job_is_an_error() {
        let mut first = page(true, Some(customers_schema()), &[1], Some("p2"));
        first.job = None;
        let source = ScriptedSource::new(vec![first]);

        assert!(matches!(
            collect_results(&source, "SELECT 1").await,
            Err(ClientError::Connection { .. })
        ));
        assert!(source.fetched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_result_has_no_records() {
        let source = ScriptedSource::new(vec![page(true, Some(customers_schema()), &[], None)]);
        assert!(collect_results(&source, "SELECT 1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_query_file_fails_without_connecting() {
        let cfg = WarehouseConfig {
            project_id: "analytics-test".into(),
            credentials_file: None,
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(1),
        };
        let client = WarehouseClient::new(cfg, Path::new("does-not-exist"));
        assert!(matches!(
            client.query_from_file("get_customers.sql").await,
            Err(ClientError::NotFound(_))
        ));
        assert!(client.client.lock().await.is_none());
        client.close().await;
    }

    #[tokio::test]
    async fn unreadable_key_file_is_an_auth_error() {
        let cfg = WarehouseConfig {
            project_id: "analytics-test".into(),
            credentials_file: Some("does-not-exist/key.json".into()),
            max_retries: 3,
            retry_initial_backoff: Duration::from_millis(1),
        };
        let client = WarehouseClient::new(cfg, Path::new("sql"));
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::Auth { .. }));
        assert!(!err.is_transient());
    }
}
