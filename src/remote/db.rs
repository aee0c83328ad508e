//! SQL client with reconnect-and-retry
//!
//! Backends sit behind the [`SqlConnector`] / [`SqlConnection`] traits so the
//! client logic can be exercised without a live server:
//!
//! ```text
//!            DbClient (reconnect loop, host load, result save)
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!   SqliteConnector     PostgresConnector      test connectors
//! ```
//!
//! A failed query closes the handle, waits, reconnects and runs the query
//! again. After the attempt budget is spent the last error is returned
//! wrapped in [`Error::Connection`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use tokio_postgres::types::{ToSql as PgToSql, Type};
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, DatabaseQueries};
use crate::error::{Error, Result};
use crate::models::{Host, ProbeResult};
use crate::targets::HostResolver;
use crate::utils::{with_retry, RetryConfig};

// ============================================================================
// Core Types
// ============================================================================

/// Driver-neutral column or parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(v) if v.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(v) => {
                Some(*v as i64)
            }
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Timestamp(t) => Some(t.to_rfc3339()),
        }
    }

    /// Timestamps are stored natively by PostgreSQL and as text by SQLite
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            Self::Text(s) if !s.is_empty() => DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|t| t.and_utc())
                }),
            _ => None,
        }
    }
}

impl From<Option<DateTime<Utc>>> for SqlValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(Self::Null, Self::Timestamp)
    }
}

/// One result row, columns in select order
pub type SqlRow = Vec<SqlValue>;

/// An open database handle
#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Run a statement returning rows
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>>;

    /// Run a statement returning the affected row count
    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64>;

    /// Release the handle; later calls fail
    async fn close(&self);
}

/// Opens database handles
#[async_trait]
pub trait SqlConnector: Send + Sync {
    fn driver(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn SqlConnection>>;
}

/// Build the connector named by `config.driver`
pub fn connector_for(config: &DatabaseConfig) -> Result<Arc<dyn SqlConnector>> {
    match config.driver.as_str() {
        "sqlite" => Ok(Arc::new(SqliteConnector::new(&config.params))),
        "postgres" => Ok(Arc::new(PostgresConnector::new(&config.params))),
        other => Err(Error::config(format!("unsupported database driver '{other}'"))),
    }
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SqlConnector for SqliteConnector {
    fn driver(&self) -> &str {
        "sqlite"
    }

    async fn connect(&self) -> Result<Arc<dyn SqlConnection>> {
        let conn = rusqlite::Connection::open(&self.path)?;
        debug!(path = %self.path.display(), "Opened SQLite database");
        Ok(Arc::new(SqliteConnection {
            conn: Mutex::new(Some(conn)),
        }))
    }
}

struct SqliteConnection {
    conn: Mutex<Option<rusqlite::Connection>>,
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            SqlValue::Null => Value::Null,
            SqlValue::Int(v) => Value::Integer(*v),
            SqlValue::Float(v) => Value::Real(*v),
            SqlValue::Text(s) => Value::Text(s.clone()),
            SqlValue::Timestamp(t) => Value::Text(t.to_rfc3339()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

fn sqlite_value(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::Int(v),
        ValueRef::Real(v) => SqlValue::Float(v),
        ValueRef::Text(t) | ValueRef::Blob(t) => {
            SqlValue::Text(String::from_utf8_lossy(t).into_owned())
        }
    }
}

impl SqliteConnection {
    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|e| Error::Database(format!("Lock poisoned: {e}")))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Database("connection closed".into()))?;
        f(conn)
    }
}

#[async_trait]
impl SqlConnection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns = stmt.column_count();
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|i| row.get_ref(i).map(sqlite_value))
                    .collect::<rusqlite::Result<SqlRow>>()
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.with_conn(|conn| {
            let changed = conn.execute(sql, rusqlite::params_from_iter(params.iter()))?;
            Ok(changed as u64)
        })
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            guard.take();
        }
    }
}

// ============================================================================
// PostgreSQL Implementation
// ============================================================================

/// PostgreSQL server reached through a connection string
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    params: String,
}

impl PostgresConnector {
    pub fn new(params: impl Into<String>) -> Self {
        Self {
            params: params.into(),
        }
    }
}

#[async_trait]
impl SqlConnector for PostgresConnector {
    fn driver(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<Arc<dyn SqlConnection>> {
        let (client, connection) = tokio_postgres::connect(&self.params, tokio_postgres::NoTls).await?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        Ok(Arc::new(PostgresConnection {
            client: tokio::sync::Mutex::new(Some(client)),
        }))
    }
}

struct PostgresConnection {
    client: tokio::sync::Mutex<Option<tokio_postgres::Client>>,
}

type PgParam = Box<dyn PgToSql + Sync + Send>;

fn typed<T>(value: &SqlValue, ty: &Type, f: impl Fn(&SqlValue) -> Option<T>) -> Result<Option<T>> {
    if value.is_null() {
        return Ok(None);
    }
    f(value)
        .map(Some)
        .ok_or_else(|| Error::Database(format!("cannot bind {value:?} as {ty}")))
}

/// `None` for finite values outside the `real` range
fn narrow_f32(n: f64) -> Option<f32> {
    if n.is_finite() && n.abs() > f64::from(f32::MAX) {
        return None;
    }
    Some(n as f32)
}

/// Convert a parameter to the type the prepared statement expects
///
/// Values that do not fit the column type are rejected, never truncated.
fn pg_param(value: &SqlValue, ty: &Type) -> Result<PgParam> {
    let param: PgParam = match ty.name() {
        "int2" => Box::new(typed(value, ty, |v| v.as_i64().and_then(|n| i16::try_from(n).ok()))?),
        "int4" => Box::new(typed(value, ty, |v| v.as_i64().and_then(|n| i32::try_from(n).ok()))?),
        "int8" => Box::new(typed(value, ty, SqlValue::as_i64)?),
        "float4" => Box::new(typed(value, ty, |v| v.as_f64().and_then(narrow_f32))?),
        "float8" => Box::new(typed(value, ty, SqlValue::as_f64)?),
        "timestamptz" => Box::new(typed(value, ty, SqlValue::as_timestamp)?),
        "timestamp" => Box::new(typed(value, ty, |v| v.as_timestamp().map(|t| t.naive_utc()))?),
        "text" | "varchar" | "bpchar" | "name" => Box::new(typed(value, ty, SqlValue::as_text)?),
        other => {
            return Err(Error::Database(format!(
                "unsupported parameter type '{other}'"
            )))
        }
    };
    Ok(param)
}

fn pg_row(row: &tokio_postgres::Row) -> Result<SqlRow> {
    let mut values = Vec::with_capacity(row.len());

    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_().name() {
            "int2" => row.try_get::<_, Option<i16>>(i)?.map(|v| SqlValue::Int(v.into())),
            "int4" => row.try_get::<_, Option<i32>>(i)?.map(|v| SqlValue::Int(v.into())),
            "int8" => row.try_get::<_, Option<i64>>(i)?.map(SqlValue::Int),
            "float4" => row.try_get::<_, Option<f32>>(i)?.map(|v| SqlValue::Float(v.into())),
            "float8" => row.try_get::<_, Option<f64>>(i)?.map(SqlValue::Float),
            "bool" => row.try_get::<_, Option<bool>>(i)?.map(|v| SqlValue::Int(v.into())),
            "timestamptz" => row
                .try_get::<_, Option<DateTime<Utc>>>(i)?
                .map(SqlValue::Timestamp),
            "timestamp" => row
                .try_get::<_, Option<NaiveDateTime>>(i)?
                .map(|t| SqlValue::Timestamp(t.and_utc())),
            _ => row.try_get::<_, Option<String>>(i)?.map(SqlValue::Text),
        };
        values.push(value.unwrap_or(SqlValue::Null));
    }

    Ok(values)
}

impl PostgresConnection {
    async fn bind(
        client: &tokio_postgres::Client,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<(tokio_postgres::Statement, Vec<PgParam>)> {
        let stmt = client.prepare(sql).await?;
        let bound = stmt
            .params()
            .iter()
            .zip(params)
            .map(|(ty, value)| pg_param(value, ty))
            .collect::<Result<Vec<_>>>()?;
        Ok((stmt, bound))
    }
}

fn as_refs(params: &[PgParam]) -> Vec<&(dyn PgToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn PgToSql + Sync))
        .collect()
}

#[async_trait]
impl SqlConnection for PostgresConnection {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| Error::Database("connection closed".into()))?;

        let (stmt, bound) = Self::bind(client, sql, params).await?;
        let rows = client.query(&stmt, &as_refs(&bound)).await?;
        rows.iter().map(pg_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        let guard = self.client.lock().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| Error::Database("connection closed".into()))?;

        let (stmt, bound) = Self::bind(client, sql, params).await?;
        Ok(client.execute(&stmt, &as_refs(&bound)).await?)
    }

    async fn close(&self) {
        self.client.lock().await.take();
    }
}

// ============================================================================
// Database Client
// ============================================================================

/// Queries and retry policy of a [`DbClient`]
#[derive(Debug, Clone)]
pub struct DbClientConfig {
    pub server_id: i64,
    pub queries: DatabaseQueries,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for DbClientConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            queries: DatabaseQueries::default(),
            max_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl From<&DatabaseConfig> for DbClientConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            server_id: config.server_id,
            queries: config.queries.clone(),
            max_attempts: config.max_attempts,
            reconnect_delay: config.reconnect_delay,
        }
    }
}

enum DbState {
    Disconnected,
    Connected(Arc<dyn SqlConnection>),
}

/// Database client shared by the database source and sink
pub struct DbClient {
    connector: Arc<dyn SqlConnector>,
    config: DbClientConfig,
    retry: RetryConfig,
    state: tokio::sync::Mutex<DbState>,
}

impl DbClient {
    pub fn new(connector: Arc<dyn SqlConnector>, config: DbClientConfig) -> Self {
        let retry = RetryConfig::fixed(config.max_attempts, config.reconnect_delay);
        Self {
            connector,
            config,
            retry,
            state: tokio::sync::Mutex::new(DbState::Disconnected),
        }
    }

    /// Client for the configured driver
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Ok(Self::new(connector_for(config)?, DbClientConfig::from(config)))
    }

    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, DbState::Connected(_))
    }

    /// Current handle, connecting first when needed
    async fn handle(&self) -> Result<Arc<dyn SqlConnection>> {
        let mut state = self.state.lock().await;
        if let DbState::Connected(conn) = &*state {
            return Ok(Arc::clone(conn));
        }

        let conn = self.connector.connect().await?;
        info!(driver = self.connector.driver(), "Connected to database");
        *state = DbState::Connected(Arc::clone(&conn));
        Ok(conn)
    }

    /// Close `stale` if it is still the current handle
    async fn invalidate(&self, stale: &Arc<dyn SqlConnection>) {
        let mut state = self.state.lock().await;
        if let DbState::Connected(current) = &*state {
            if Arc::ptr_eq(current, stale) {
                current.close().await;
                *state = DbState::Disconnected;
            }
        }
    }

    /// Run `op` against the current handle, reconnecting between failed attempts
    pub async fn with_reconnect<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn SqlConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        with_retry(&self.retry, |attempt| async move {
            if attempt > 0 {
                crate::metrics::record_remote_retry("db");
            }

            let conn = self.handle().await?;
            match op(Arc::clone(&conn)).await {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.invalidate(&conn).await;
                    Err(e)
                }
            }
        })
        .await
        .map_err(|failure| Error::Connection {
            attempts: failure.attempts,
            source: Box::new(failure.error),
        })
    }

    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>> {
        self.with_reconnect(|conn| async move { conn.query(sql, params).await })
            .await
    }

    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        self.with_reconnect(|conn| async move { conn.execute(sql, params).await })
            .await
    }

    /// Load this server's devices as hosts
    ///
    /// Every address goes through `resolver`; the first bad one aborts the load.
    pub async fn load_hosts(&self, resolver: &HostResolver) -> Result<Vec<Host>> {
        let params = [SqlValue::Int(self.config.server_id)];
        let rows = self.query(&self.config.queries.get_devices, &params).await?;

        let mut hosts = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .first()
                .and_then(SqlValue::as_i64)
                .ok_or_else(|| Error::Database("device row without id".into()))?;
            let ip = row
                .get(1)
                .and_then(SqlValue::as_text)
                .ok_or_else(|| Error::Database(format!("device {id} without ip")))?;

            let mut host = resolver.host(&ip).await?.with_id(id);
            host.inactive_since = row.get(2).and_then(SqlValue::as_timestamp);
            hosts.push(host);
        }

        Ok(hosts)
    }

    /// Store loss, average time and liveness of one probed host
    pub async fn save_result(&self, result: &ProbeResult) -> Result<()> {
        if result.host.id == 0 {
            debug!(host = %result.host, "Host has no database id, skipping");
            return Ok(());
        }

        let inactive_since = inactive_since_after(result);
        let params = [
            SqlValue::Float(result.loss),
            SqlValue::Float(result.avg_time_secs()),
            SqlValue::from(inactive_since),
            SqlValue::Int(result.host.id),
        ];

        self.execute(&self.config.queries.update_device, &params)
            .await?;
        Ok(())
    }

    /// Drop the handle
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let DbState::Connected(conn) = std::mem::replace(&mut *state, DbState::Disconnected) {
            conn.close().await;
            debug!("Database connection closed");
        }
    }
}

/// Total loss keeps the earliest inactive-since timestamp; any reply clears it
pub fn inactive_since_after(result: &ProbeResult) -> Option<DateTime<Utc>> {
    if result.is_total_loss() {
        Some(result.host.inactive_since.unwrap_or_else(Utc::now))
    } else {
        None
    }
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("driver", &self.connector.driver())
            .field("server_id", &self.config.server_id)
            .finish_non_exhaustive()
    }
}
