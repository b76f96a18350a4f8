//! Warehouse collaborator boundary: SQL rendering, optimistic-concurrency
//! update dispatch, and TTL-scoped staging tables.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cbl_core::{columns, row_value, Row, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column as _, PgPool, Row as _, TypeInfo as _};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

pub const CRATE_NAME: &str = "cbl-warehouse";

/// Errors surfaced by the collaborator itself. `Conflict` is the
/// optimistic-concurrency collision signal; everything else is terminal
/// from this crate's perspective.
#[derive(Debug, Clone, Error)]
pub enum WarehouseError {
    #[error("write collision on {0}")]
    Conflict(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("staging load rejected {failed} rows on {table}")]
    LoadRejected { table: String, failed: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_error(err: &WarehouseError) -> RetryDisposition {
    match err {
        WarehouseError::Conflict(_) => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// One rejected row from a bulk submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Replace,
    Append,
    FailIfExists,
}

/// The single external collaborator this pipeline talks to. Absent rows
/// come back as empty result sets, and rejected rows come back as
/// values, never as transport errors.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError>;

    async fn execute_update(&self, sql: &str) -> Result<u64, WarehouseError>;

    async fn insert_rows(&self, table: &str, rows: &[Row])
        -> Result<Vec<RowError>, WarehouseError>;

    async fn load_table(
        &self,
        table: &str,
        rows: &[Row],
        mode: LoadMode,
    ) -> Result<Vec<RowError>, WarehouseError>;

    async fn set_expiry(
        &self,
        table: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), WarehouseError>;
}

/// Render a value as a SQL literal. Numerics and booleans go bare,
/// strings and timestamps quoted with `''` escaping.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Timestamp(ts) => format!("'{}'", ts.to_rfc3339()),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly namespace-qualified table name part by part.
pub fn quote_table(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// What a WHERE predicate compares against: a literal fixed in the spec,
/// or the current row's own value for that field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateValue {
    Literal(Value),
    RowField,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub op: CompareOp,
    pub value: PredicateValue,
}

/// Declarative description of one family of UPDATE statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub table: String,
    pub predicates: Vec<Predicate>,
    /// Fields that stay in SET even though a predicate consumes them.
    #[serde(default)]
    pub always_set: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub include_only: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("invalid update spec: {0}")]
    InvalidSpec(String),
    #[error("update on {table} does not refresh {column}")]
    MissingAuditStamp { table: String, column: String },
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}

/// A rendered UPDATE plus enough metadata for pre-dispatch validation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatement {
    table: String,
    sql: String,
    set_fields: Vec<String>,
}

impl UpdateStatement {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn refreshes(&self, column: &str) -> bool {
        self.set_fields.iter().any(|f| f == column)
    }
}

/// Build one UPDATE for one row. SET takes every row field a predicate
/// does not consume, minus exclusions, honoring `include_only` and
/// `always_set` overrides. Null predicate values render as IS NULL.
pub fn build_update(row: &Row, spec: &UpdateSpec) -> Result<UpdateStatement, UpdateError> {
    if spec.predicates.is_empty() {
        return Err(UpdateError::InvalidSpec(format!(
            "spec for {} declares no predicates",
            spec.table
        )));
    }

    let where_fields: BTreeSet<&str> = spec
        .predicates
        .iter()
        .map(|p| p.field.as_str())
        .collect();

    let mut set_fields = Vec::new();
    let mut assignments = Vec::new();
    for (field, value) in row {
        if let Some(only) = &spec.include_only {
            if !only.contains(field) {
                continue;
            }
        }
        if spec.excluded.contains(field) {
            continue;
        }
        if where_fields.contains(field.as_str()) && !spec.always_set.contains(field) {
            continue;
        }
        assignments.push(format!("{} = {}", quote_ident(field), sql_literal(value)));
        set_fields.push(field.clone());
    }
    if assignments.is_empty() {
        return Err(UpdateError::InvalidSpec(format!(
            "spec for {} leaves no fields to set",
            spec.table
        )));
    }

    let mut conditions = Vec::new();
    for predicate in &spec.predicates {
        let value = match &predicate.value {
            PredicateValue::Literal(v) => v.clone(),
            PredicateValue::RowField => row_value(row, &predicate.field).clone(),
        };
        let column = quote_ident(&predicate.field);
        let rendered = if value.is_null() {
            match predicate.op {
                CompareOp::Eq => format!("{column} IS NULL"),
                CompareOp::Ne => format!("{column} IS NOT NULL"),
                _ => {
                    return Err(UpdateError::InvalidSpec(format!(
                        "predicate on {} orders against NULL",
                        predicate.field
                    )))
                }
            }
        } else {
            format!("{column} {} {}", predicate.op.as_sql(), sql_literal(&value))
        };
        conditions.push(rendered);
    }

    Ok(UpdateStatement {
        table: spec.table.clone(),
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            quote_table(&spec.table),
            assignments.join(", "),
            conditions.join(" AND ")
        ),
        set_fields,
    })
}

/// Build one statement per row of a tabular batch.
pub fn build_updates(rows: &[Row], spec: &UpdateSpec) -> Result<Vec<UpdateStatement>, UpdateError> {
    rows.iter().map(|row| build_update(row, spec)).collect()
}

/// Pause abstraction so retry tests run without wall-clock delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, interval: Duration);
}

#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// Fixed-interval retry budget for conflict-classified errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempts: usize,
    pub affected: u64,
}

/// Dispatches UPDATE statements one at a time. Write collisions back off
/// for a fixed interval and resubmit against the latest state; any other
/// collaborator error propagates on the first attempt.
pub struct UpdateExecutor {
    warehouse: Arc<dyn Warehouse>,
    retry: RetryPolicy,
    sleeper: Box<dyn Sleeper>,
}

impl UpdateExecutor {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            retry: RetryPolicy::default(),
            sleeper: Box::new(TokioSleeper),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn dispatch(
        &self,
        statement: &UpdateStatement,
    ) -> Result<DispatchReport, UpdateError> {
        if !statement.refreshes(columns::UPDATED_AT) {
            return Err(UpdateError::MissingAuditStamp {
                table: statement.table().to_string(),
                column: columns::UPDATED_AT.to_string(),
            });
        }

        let span = info_span!("update_dispatch", table = statement.table());
        let _guard = span.enter();

        let mut attempts = 0usize;
        loop {
            attempts += 1;
            debug!(attempts, "submitting update");
            match self.warehouse.execute_update(statement.sql()).await {
                Ok(affected) => {
                    debug!(attempts, affected, "update succeeded");
                    return Ok(DispatchReport { attempts, affected });
                }
                Err(err)
                    if classify_error(&err) == RetryDisposition::Retryable
                        && attempts <= self.retry.max_retries =>
                {
                    warn!(attempts, "write collision, backing off and resubmitting");
                    self.sleeper.sleep(self.retry.backoff).await;
                }
                Err(err) => {
                    warn!(attempts, error = %err, "update failed fatally");
                    return Err(err.into());
                }
            }
        }
    }

    pub async fn dispatch_all(
        &self,
        statements: &[UpdateStatement],
    ) -> Result<Vec<DispatchReport>, UpdateError> {
        let mut reports = Vec::with_capacity(statements.len());
        for statement in statements {
            reports.push(self.dispatch(statement).await?);
        }
        Ok(reports)
    }
}

/// A staged scratch table and the moment it stops being referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    pub table: String,
    pub mode: LoadMode,
    pub expires_at: DateTime<Utc>,
}

/// Creates scratch tables under a namespace with a fixed 1-hour
/// retention, so overlapping pipeline runs never fight over a shared
/// named resource beyond that window.
pub struct StagingTables {
    warehouse: Arc<dyn Warehouse>,
    namespace: String,
}

impl StagingTables {
    pub fn new(warehouse: Arc<dyn Warehouse>, namespace: impl Into<String>) -> Self {
        Self {
            warehouse,
            namespace: namespace.into(),
        }
    }

    pub async fn stage(
        &self,
        name: &str,
        rows: &[Row],
        mode: LoadMode,
        now: DateTime<Utc>,
    ) -> Result<StagingTable, WarehouseError> {
        let table = format!("{}.{}", self.namespace, name);
        let errors = self.warehouse.load_table(&table, rows, mode).await?;
        if !errors.is_empty() {
            // Partially loaded staging content is never trusted.
            return Err(WarehouseError::LoadRejected {
                table,
                failed: errors.len(),
            });
        }
        let expires_at = now + chrono::Duration::hours(1);
        self.warehouse.set_expiry(&table, expires_at).await?;
        info!(%table, %expires_at, rows = rows.len(), "staged rows");
        Ok(StagingTable {
            table,
            mode,
            expires_at,
        })
    }
}

/// In-memory collaborator used by tests and `--dry-run` ingestion. Query
/// results and failures are scripted FIFO; issued SQL is recorded.
#[derive(Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<Row>>,
    expiries: BTreeMap<String, DateTime<Utc>>,
    query_results: VecDeque<Vec<Row>>,
    update_failures: VecDeque<WarehouseError>,
    insert_failures: VecDeque<Vec<RowError>>,
    load_failures: VecDeque<Vec<RowError>>,
    queries: Vec<String>,
    updates: Vec<String>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_query_result(&self, rows: Vec<Row>) {
        self.state.lock().unwrap().query_results.push_back(rows);
    }

    pub fn fail_next_update(&self, err: WarehouseError) {
        self.state.lock().unwrap().update_failures.push_back(err);
    }

    pub fn fail_next_insert(&self, errors: Vec<RowError>) {
        self.state.lock().unwrap().insert_failures.push_back(errors);
    }

    pub fn fail_next_load(&self, errors: Vec<RowError>) {
        self.state.lock().unwrap().load_failures.push_back(errors);
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.state.lock().unwrap().updates.clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn expiry(&self, table: &str) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().expiries.get(table).copied()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        state.queries.push(sql.to_string());
        Ok(state.query_results.pop_front().unwrap_or_default())
    }

    async fn execute_update(&self, sql: &str) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        state.updates.push(sql.to_string());
        match state.update_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(1),
        }
    }

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[Row],
    ) -> Result<Vec<RowError>, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        if let Some(errors) = state.insert_failures.pop_front() {
            return Ok(errors);
        }
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(Vec::new())
    }

    async fn load_table(
        &self,
        table: &str,
        rows: &[Row],
        mode: LoadMode,
    ) -> Result<Vec<RowError>, WarehouseError> {
        let mut state = self.state.lock().unwrap();
        if let Some(errors) = state.load_failures.pop_front() {
            return Ok(errors);
        }
        match mode {
            LoadMode::FailIfExists if state.tables.contains_key(table) => {
                return Err(WarehouseError::Query(format!(
                    "table {table} already exists"
                )));
            }
            LoadMode::Replace => {
                state.tables.insert(table.to_string(), rows.to_vec());
            }
            LoadMode::Append | LoadMode::FailIfExists => {
                state
                    .tables
                    .entry(table.to_string())
                    .or_default()
                    .extend(rows.iter().cloned());
            }
        }
        Ok(Vec::new())
    }

    async fn set_expiry(
        &self,
        table: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), WarehouseError> {
        self.state
            .lock()
            .unwrap()
            .expiries
            .insert(table.to_string(), expires_at);
        Ok(())
    }
}

/// Postgres-backed collaborator. Serialization failures and deadlocks
/// (SQLSTATE 40001 / 40P01) surface as the conflict signal.
pub struct PgWarehouse {
    pool: PgPool,
}

const EXPIRY_REGISTRY: &str = "cbl_table_expiry";

impl PgWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| WarehouseError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Drop every staging table whose retention window has passed.
    pub async fn drop_expired(&self, now: DateTime<Utc>) -> Result<usize, WarehouseError> {
        let expired = sqlx::query(&format!(
            "SELECT table_name FROM {EXPIRY_REGISTRY} WHERE expires_at < {}",
            sql_literal(&Value::Timestamp(now))
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        let mut dropped = 0usize;
        for row in expired {
            let table: String = row
                .try_get("table_name")
                .map_err(|err| WarehouseError::Query(err.to_string()))?;
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_table(&table)))
                .execute(&self.pool)
                .await
                .map_err(classify_sqlx)?;
            sqlx::query(&format!(
                "DELETE FROM {EXPIRY_REGISTRY} WHERE table_name = {}",
                sql_literal(&Value::Text(table))
            ))
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
            dropped += 1;
        }
        Ok(dropped)
    }
}

fn classify_sqlx(err: sqlx::Error) -> WarehouseError {
    match &err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("40001") | Some("40P01") => WarehouseError::Conflict(db.message().to_string()),
            _ => WarehouseError::Query(db.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => WarehouseError::Unavailable(err.to_string()),
        _ => WarehouseError::Query(err.to_string()),
    }
}

fn decode_pg_row(row: &PgRow) -> Row {
    let mut out = Row::new();
    for column in row.columns() {
        let name = column.name();
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(name)
                .ok()
                .flatten()
                .map(Value::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::Int(v.into())),
            "INT4" => row
                .try_get::<Option<i32>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::Int(v.into())),
            "INT8" => row
                .try_get::<Option<i64>, _>(name)
                .ok()
                .flatten()
                .map(Value::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(name)
                .ok()
                .flatten()
                .map(|v| Value::Float(v.into())),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(name)
                .ok()
                .flatten()
                .map(Value::Float),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(name)
                .ok()
                .flatten()
                .map(Value::Timestamp),
            _ => row
                .try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .map(Value::Text),
        };
        out.insert(name.to_string(), value.unwrap_or(Value::Null));
    }
    out
}

/// Union of the column names across a batch of rows.
fn column_union(rows: &[Row]) -> Vec<String> {
    let mut names = BTreeSet::new();
    for row in rows {
        for field in row.keys() {
            names.insert(field.clone());
        }
    }
    names.into_iter().collect()
}

fn pg_type_for(value: &Value) -> &'static str {
    match value {
        Value::Bool(_) => "BOOLEAN",
        Value::Int(_) => "BIGINT",
        Value::Float(_) => "DOUBLE PRECISION",
        Value::Timestamp(_) => "TIMESTAMPTZ",
        Value::Null | Value::Text(_) => "TEXT",
    }
}

fn insert_sql(table: &str, names: &[String], rows: &[Row]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| quote_ident(n)).collect();
    let tuples: Vec<String> = rows
        .iter()
        .map(|row| {
            let values: Vec<String> = names
                .iter()
                .map(|name| sql_literal(row_value(row, name)))
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_table(table),
        quoted.join(", "),
        tuples.join(", ")
    )
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, WarehouseError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(rows.iter().map(decode_pg_row).collect())
    }

    async fn execute_update(&self, sql: &str) -> Result<u64, WarehouseError> {
        let done = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;
        Ok(done.rows_affected())
    }

    async fn insert_rows(
        &self,
        table: &str,
        rows: &[Row],
    ) -> Result<Vec<RowError>, WarehouseError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let names = column_union(rows);
        let sql = insert_sql(table, &names, rows);
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(Vec::new()),
            // Constraint violations are data problems with the submitted
            // rows; everything else is the collaborator failing.
            Err(sqlx::Error::Database(db)) if db.code().is_some_and(|c| c.starts_with("23")) => {
                Ok(vec![RowError {
                    index: 0,
                    message: db.message().to_string(),
                }])
            }
            Err(err) => Err(classify_sqlx(err)),
        }
    }

    async fn load_table(
        &self,
        table: &str,
        rows: &[Row],
        mode: LoadMode,
    ) -> Result<Vec<RowError>, WarehouseError> {
        if rows.is_empty() {
            return Err(WarehouseError::Query(
                "cannot infer a schema for an empty staging load".to_string(),
            ));
        }
        let names = column_union(rows);
        let column_defs: Vec<String> = names
            .iter()
            .map(|name| {
                let sample = rows
                    .iter()
                    .map(|row| row_value(row, name))
                    .find(|v| !v.is_null())
                    .unwrap_or(&Value::Null);
                format!("{} {}", quote_ident(name), pg_type_for(sample))
            })
            .collect();

        let quoted = quote_table(table);
        let create = match mode {
            LoadMode::Replace => {
                sqlx::query(&format!("DROP TABLE IF EXISTS {quoted}"))
                    .execute(&self.pool)
                    .await
                    .map_err(classify_sqlx)?;
                format!("CREATE TABLE {quoted} ({})", column_defs.join(", "))
            }
            LoadMode::Append => {
                format!("CREATE TABLE IF NOT EXISTS {quoted} ({})", column_defs.join(", "))
            }
            LoadMode::FailIfExists => {
                format!("CREATE TABLE {quoted} ({})", column_defs.join(", "))
            }
        };
        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(classify_sqlx)?;

        let sql = insert_sql(table, &names, rows);
        match sqlx::query(&sql).execute(&self.pool).await {
            Ok(_) => Ok(Vec::new()),
            Err(sqlx::Error::Database(db)) if db.code().is_some_and(|c| c.starts_with("23")) => {
                Ok(vec![RowError {
                    index: 0,
                    message: db.message().to_string(),
                }])
            }
            Err(err) => Err(classify_sqlx(err)),
        }
    }

    async fn set_expiry(
        &self,
        table: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), WarehouseError> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {EXPIRY_REGISTRY} \
             (table_name TEXT PRIMARY KEY, expires_at TIMESTAMPTZ NOT NULL)"
        ))
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;

        sqlx::query(&format!(
            "INSERT INTO {EXPIRY_REGISTRY} (table_name, expires_at) VALUES ({}, {}) \
             ON CONFLICT (table_name) DO UPDATE SET expires_at = EXCLUDED.expires_at",
            sql_literal(&Value::Text(table.to_string())),
            sql_literal(&Value::Timestamp(expires_at))
        ))
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordedSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordedSleeper {
        async fn sleep(&self, interval: Duration) {
            self.slept.lock().unwrap().push(interval);
        }
    }

    fn paid_row() -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::Int(5));
        row.insert("status".to_string(), Value::from("paid"));
        row
    }

    fn stamped_row() -> Row {
        let mut row = paid_row();
        row.insert(
            columns::UPDATED_AT.to_string(),
            Value::Timestamp(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap()),
        );
        row
    }

    fn id_spec(table: &str) -> UpdateSpec {
        UpdateSpec {
            table: table.to_string(),
            predicates: vec![Predicate {
                field: "id".to_string(),
                op: CompareOp::Eq,
                value: PredicateValue::RowField,
            }],
            always_set: Vec::new(),
            excluded: Vec::new(),
            include_only: None,
        }
    }

    #[test]
    fn where_fields_are_excluded_from_set() {
        let statement = build_update(&paid_row(), &id_spec("invoices")).unwrap();
        assert_eq!(
            statement.sql(),
            "UPDATE \"invoices\" SET \"status\" = 'paid' WHERE \"id\" = 5"
        );
    }

    #[test]
    fn always_set_keeps_a_predicate_field_in_set() {
        let mut spec = id_spec("invoices");
        spec.always_set.push("id".to_string());
        let statement = build_update(&paid_row(), &spec).unwrap();
        assert_eq!(
            statement.sql(),
            "UPDATE \"invoices\" SET \"id\" = 5, \"status\" = 'paid' WHERE \"id\" = 5"
        );
    }

    #[test]
    fn null_predicate_renders_is_null() {
        let mut row = stamped_row();
        row.insert("credited_at".to_string(), Value::Null);
        let spec = UpdateSpec {
            table: "refund_claims".to_string(),
            predicates: vec![Predicate {
                field: "credited_at".to_string(),
                op: CompareOp::Eq,
                value: PredicateValue::RowField,
            }],
            always_set: Vec::new(),
            excluded: Vec::new(),
            include_only: None,
        };
        let statement = build_update(&row, &spec).unwrap();
        assert!(statement.sql().contains("WHERE \"credited_at\" IS NULL"));
    }

    #[test]
    fn literal_encoding_is_type_aware() {
        assert_eq!(sql_literal(&Value::Int(7)), "7");
        assert_eq!(sql_literal(&Value::Bool(true)), "true");
        assert_eq!(sql_literal(&Value::Float(2.5)), "2.5");
        assert_eq!(sql_literal(&Value::from("O'Brien")), "'O''Brien'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        let ts = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();
        assert_eq!(sql_literal(&Value::Timestamp(ts)), "'2026-03-02T09:00:00+00:00'");
    }

    #[test]
    fn empty_predicates_are_a_malformed_spec() {
        let spec = UpdateSpec {
            table: "invoices".to_string(),
            predicates: Vec::new(),
            always_set: Vec::new(),
            excluded: Vec::new(),
            include_only: None,
        };
        assert!(matches!(
            build_update(&paid_row(), &spec),
            Err(UpdateError::InvalidSpec(_))
        ));
    }

    #[tokio::test]
    async fn statement_without_audit_refresh_is_rejected_before_dispatch() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let executor = UpdateExecutor::new(warehouse.clone())
            .with_sleeper(Box::new(RecordedSleeper::default()));
        let statement = build_update(&paid_row(), &id_spec("invoices")).unwrap();

        let err = executor.dispatch(&statement).await.unwrap_err();
        assert!(matches!(err, UpdateError::MissingAuditStamp { .. }));
        assert!(warehouse.updates().is_empty());
    }

    #[tokio::test]
    async fn permanent_conflict_exhausts_five_attempts() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        for _ in 0..5 {
            warehouse.fail_next_update(WarehouseError::Conflict("invoices".to_string()));
        }
        let sleeper = Box::new(RecordedSleeper::default());
        let executor = UpdateExecutor::new(warehouse.clone()).with_sleeper(sleeper);
        let statement = build_update(&stamped_row(), &id_spec("invoices")).unwrap();

        let err = executor.dispatch(&statement).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Warehouse(WarehouseError::Conflict(_))
        ));
        assert_eq!(warehouse.updates().len(), 5);
    }

    #[tokio::test]
    async fn transient_conflict_recovers() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_next_update(WarehouseError::Conflict("invoices".to_string()));
        warehouse.fail_next_update(WarehouseError::Conflict("invoices".to_string()));
        let executor = UpdateExecutor::new(warehouse.clone())
            .with_sleeper(Box::new(RecordedSleeper::default()));
        let statement = build_update(&stamped_row(), &id_spec("invoices")).unwrap();

        let report = executor.dispatch(&statement).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(warehouse.updates().len(), 3);
    }

    #[tokio::test]
    async fn non_conflict_error_propagates_without_retry() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_next_update(WarehouseError::Unavailable("auth expired".to_string()));
        let executor = UpdateExecutor::new(warehouse.clone())
            .with_sleeper(Box::new(RecordedSleeper::default()));
        let statement = build_update(&stamped_row(), &id_spec("invoices")).unwrap();

        let err = executor.dispatch(&statement).await.unwrap_err();
        assert!(matches!(
            err,
            UpdateError::Warehouse(WarehouseError::Unavailable(_))
        ));
        assert_eq!(warehouse.updates().len(), 1);
    }

    #[tokio::test]
    async fn staging_sets_a_one_hour_expiry() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let staging = StagingTables::new(warehouse.clone(), "scratch");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();

        let staged = staging
            .stage("claims_run1", &[paid_row()], LoadMode::Replace, now)
            .await
            .unwrap();
        assert_eq!(staged.table, "scratch.claims_run1");
        assert_eq!(staged.expires_at, now + chrono::Duration::hours(1));
        assert_eq!(warehouse.expiry("scratch.claims_run1"), Some(staged.expires_at));
    }

    #[tokio::test]
    async fn replace_mode_reload_succeeds_on_an_existing_table() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let staging = StagingTables::new(warehouse.clone(), "scratch");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();

        staging
            .stage("claims", &[paid_row()], LoadMode::Replace, now)
            .await
            .unwrap();
        staging
            .stage("claims", &[paid_row(), stamped_row()], LoadMode::Replace, now)
            .await
            .unwrap();
        assert_eq!(warehouse.rows("scratch.claims").len(), 2);

        let err = staging
            .stage("claims", &[paid_row()], LoadMode::FailIfExists, now)
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Query(_)));
    }

    #[tokio::test]
    async fn partial_staging_load_is_fatal() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_next_load(vec![RowError {
            index: 3,
            message: "bad value".to_string(),
        }]);
        let staging = StagingTables::new(warehouse.clone(), "scratch");
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap();

        let err = staging
            .stage("claims", &[paid_row()], LoadMode::Append, now)
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::LoadRejected { failed: 1, .. }));
        assert_eq!(warehouse.expiry("scratch.claims"), None);
    }

    #[test]
    fn sqlstate_serialization_failure_classifies_as_conflict() {
        let conflict = WarehouseError::Conflict("invoices".to_string());
        assert_eq!(classify_error(&conflict), RetryDisposition::Retryable);
        let query = WarehouseError::Query("syntax".to_string());
        assert_eq!(classify_error(&query), RetryDisposition::NonRetryable);
    }
}
