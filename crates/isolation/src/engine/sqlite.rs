//! SQLite engine on an r2d2 pool.
//!
//! File databases get a regular pool. In-memory databases are opened as a
//! uniquely named shared-cache database (`file:<name>?mode=memory&cache=shared`)
//! so that every pooled connection sees the same data. The engine holds one
//! extra keep-alive connection, because SQLite frees a shared in-memory
//! database as soon as its last connection closes.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OpenFlags, params_from_iter};
use rusqlite::types::{Value, ValueRef};

use crate::config::{PoolSettings, mask_url, sqlite_file_path};
use crate::dialect::{Dialect, DialectCapabilities};
use crate::error::EngineError;

use super::{Connection, Engine, Row, SqlValue};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn statement_error(e: rusqlite::Error) -> EngineError {
    EngineError::Statement {
        dialect: Dialect::Sqlite.to_string(),
        message: e.to_string(),
    }
}

fn init_connection(conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON")
}

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
}

/// SQLite engine.
pub struct SqliteEngine {
    url: String,
    capabilities: DialectCapabilities,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
    keep_alive: Mutex<Option<rusqlite::Connection>>,
}

impl fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("url", &mask_url(&self.url))
            .field("in_memory", &self.capabilities.is_in_memory())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl SqliteEngine {
    /// Builds a lazy pool for a `sqlite://` URL.
    pub fn open(url: &str, settings: &PoolSettings) -> Result<Self, EngineError> {
        if settings.max_connections == 0 {
            return Err(EngineError::Internal {
                message: "pool max_connections must be at least 1".to_string(),
            });
        }
        let capabilities = DialectCapabilities::from_url(url);

        let (manager, keep_alive) = if capabilities.requires_static_connection_pool() {
            let uri = format!(
                "file:tenantry-{}?mode=memory&cache=shared",
                uuid::Uuid::new_v4().simple()
            );
            let keep_alive = rusqlite::Connection::open_with_flags(&uri, open_flags()).map_err(|e| {
                EngineError::ConnectionFailed {
                    dialect: Dialect::Sqlite.to_string(),
                    message: e.to_string(),
                }
            })?;
            let manager = SqliteConnectionManager::file(uri).with_flags(open_flags());
            (manager, Some(keep_alive))
        } else {
            let path = sqlite_file_path(url).ok_or_else(|| EngineError::ConnectionFailed {
                dialect: Dialect::Sqlite.to_string(),
                message: format!("no database path in {}", mask_url(url)),
            })?;
            (SqliteConnectionManager::file(path), None)
        };

        // r2d2 would otherwise keep max_size idle handles per tenant file.
        let min_idle = settings.min_idle.unwrap_or(0).min(settings.max_connections);
        let pool = Pool::builder()
            .max_size(settings.max_connections)
            .min_idle(Some(min_idle))
            .idle_timeout(settings.idle_timeout())
            .max_lifetime(settings.max_lifetime())
            .connection_timeout(settings.connect_timeout())
            .build_unchecked(manager.with_init(init_connection));

        tracing::debug!(
            url = %mask_url(url),
            in_memory = capabilities.is_in_memory(),
            "Created SQLite engine"
        );

        Ok(Self {
            url: url.to_string(),
            capabilities,
            pool: RwLock::new(Some(pool)),
            keep_alive: Mutex::new(keep_alive),
        })
    }
}

#[async_trait]
impl Engine for SqliteEngine {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.capabilities
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        let pool = self.pool.read().clone().ok_or_else(|| EngineError::Disposed {
            url: self.masked_url(),
        })?;

        // Checkout may block until a connection frees up.
        let conn = tokio::task::spawn_blocking(move || pool.get())
            .await
            .map_err(|e| EngineError::Internal {
                message: format!("connection checkout task failed: {e}"),
            })?
            .map_err(|e| EngineError::ConnectionFailed {
                dialect: Dialect::Sqlite.to_string(),
                message: e.to_string(),
            })?;

        Ok(Box::new(SqliteConnection { conn }))
    }

    async fn dispose(&self) {
        let pool = self.pool.write().take();
        // Dropping the last handle frees an in-memory database.
        self.keep_alive.lock().take();
        if pool.is_some() {
            tracing::debug!(url = %self.masked_url(), "Disposed SQLite engine");
        }
    }

    fn is_disposed(&self) -> bool {
        self.pool.read().is_none()
    }
}

struct SqliteConnection {
    conn: PooledConnection<SqliteConnectionManager>,
}

fn to_sqlite(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Bool(b) => Value::Integer(i64::from(*b)),
        SqlValue::Integer(n) => Value::Integer(*n),
        SqlValue::Real(f) => Value::Real(*f),
        SqlValue::Text(s) => Value::Text(s.clone()),
        SqlValue::Blob(b) => Value::Blob(b.clone()),
        SqlValue::Json(v) => Value::Text(v.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(n) => SqlValue::Integer(n),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(bytes) => SqlValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), EngineError> {
        self.conn.execute_batch(sql).map_err(statement_error)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, EngineError> {
        let changed = self
            .conn
            .execute(sql, params_from_iter(params.iter().map(to_sqlite)))
            .map_err(statement_error)?;
        Ok(changed as u64)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, EngineError> {
        let mut stmt = self.conn.prepare(sql).map_err(statement_error)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let columns: std::sync::Arc<[String]> = columns.into();
        let width = columns.len();

        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(statement_error)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(statement_error)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sqlite(row.get_ref(i).map_err(statement_error)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    async fn begin(&mut self) -> Result<(), EngineError> {
        self.conn.execute_batch("BEGIN").map_err(statement_error)
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        self.conn.execute_batch("COMMIT").map_err(statement_error)
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.conn.execute_batch("ROLLBACK").map_err(statement_error)
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        // Never hand a connection with an open transaction back to the pool.
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "Rollback of dropped connection failed");
            }
        }
    }
}
