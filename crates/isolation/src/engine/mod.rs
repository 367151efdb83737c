//! Database engines and connections.
//!
//! An [`Engine`] owns one connection pool for one URL. Isolation providers
//! never talk to a driver directly: they obtain engines from a
//! [`Connector`], check out [`Connection`]s and issue SQL text with bound
//! [`SqlValue`] parameters.
//!
//! | Backend | Feature | Pool |
//! |---------|---------|------|
//! | SQLite | `sqlite` (default) | r2d2 |
//! | PostgreSQL | `postgres` | deadpool |
//!
//! Other dialects are classified by [`Dialect`](crate::dialect::Dialect) but
//! have no bundled driver; plug one in through a custom [`Connector`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{PoolSettings, mask_url};
use crate::dialect::{Dialect, DialectCapabilities};
use crate::error::EngineError;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// A value bound to, or read from, a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Integer(i64),
    /// Double-precision float.
    Real(f64),
    /// Text.
    Text(String),
    /// Binary data.
    Blob(Vec<u8>),
    /// JSON document.
    Json(serde_json::Value),
}

impl SqlValue {
    /// Returns `true` for `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Returns the value as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value as text, if it is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a boolean. Integers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Integer(n) => Some(*n != 0),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<&crate::tenant::TenantId> for SqlValue {
    fn from(v: &crate::tenant::TenantId) -> Self {
        SqlValue::Text(v.as_str().to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Creates a row. `columns` is shared between rows of one result set.
    pub fn new(columns: Arc<[String]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Returns the value of a named column.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// Returns the value at a column index.
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values in column order.
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }
}

/// A checked-out database connection.
///
/// Dropping a connection returns it to its pool; an open transaction is
/// rolled back first.
#[async_trait]
pub trait Connection: Send {
    /// Dialect of the underlying engine.
    fn dialect(&self) -> Dialect;

    /// Executes one or more statements without parameters.
    async fn batch_execute(&mut self, sql: &str) -> Result<(), EngineError>;

    /// Executes one statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, EngineError>;

    /// Runs one query and collects every row.
    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, EngineError>;

    /// Opens a transaction.
    async fn begin(&mut self) -> Result<(), EngineError>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<(), EngineError>;

    /// Rolls the open transaction back.
    async fn rollback(&mut self) -> Result<(), EngineError>;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;
}

/// A connection pool for one database URL.
#[async_trait]
pub trait Engine: Send + Sync + fmt::Debug {
    /// Dialect of the target.
    fn dialect(&self) -> Dialect {
        self.capabilities().dialect()
    }

    /// Capability matrix of the target.
    fn capabilities(&self) -> &DialectCapabilities;

    /// Connection URL (may contain credentials; never log it).
    fn url(&self) -> &str;

    /// Connection URL with the password masked.
    fn masked_url(&self) -> String {
        mask_url(self.url())
    }

    /// Checks a connection out of the pool.
    async fn connect(&self) -> Result<Box<dyn Connection>, EngineError>;

    /// Closes the pool. Later checkouts fail with [`EngineError::Disposed`].
    async fn dispose(&self);

    /// Whether [`dispose`](Self::dispose) has run.
    fn is_disposed(&self) -> bool;
}

/// Creates engines for URLs.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Builds an engine. Pools are lazy: no connection is opened here.
    fn create_engine(&self, url: &str, pool: &PoolSettings) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Connector backed by the drivers compiled into this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

impl Connector for DefaultConnector {
    fn create_engine(&self, url: &str, pool: &PoolSettings) -> Result<Arc<dyn Engine>, EngineError> {
        match Dialect::from_url(url) {
            #[cfg(feature = "sqlite")]
            Dialect::Sqlite => Ok(Arc::new(sqlite::SqliteEngine::open(url, pool)?)),
            #[cfg(feature = "postgres")]
            Dialect::Postgres => Ok(Arc::new(postgres::PostgresEngine::open(url, pool)?)),
            dialect => {
                let _ = pool;
                Err(EngineError::UnsupportedDialect {
                    dialect: dialect.to_string(),
                    url: mask_url(url),
                })
            }
        }
    }
}
