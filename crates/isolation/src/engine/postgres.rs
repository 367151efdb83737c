//! PostgreSQL engine on a deadpool pool.
//!
//! Connections are recycled with [`RecyclingMethod::Clean`], which resets
//! session state (`search_path`, custom settings such as the tenant session
//! variable) before a connection is handed to the next checkout. A
//! connection dropped with an open transaction is detached from the pool
//! and closed instead of being recycled.

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use deadpool_postgres::{Config, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use postgres_types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::NoTls;

use crate::config::{PoolSettings, mask_url};
use crate::dialect::{Dialect, DialectCapabilities, strip_driver_qualifier};
use crate::error::EngineError;

use super::{Connection, Engine, Row, SqlValue};

fn statement_error(e: tokio_postgres::Error) -> EngineError {
    EngineError::Statement {
        dialect: Dialect::Postgres.to_string(),
        message: e.to_string(),
    }
}

fn connection_error(message: impl fmt::Display) -> EngineError {
    EngineError::ConnectionFailed {
        dialect: Dialect::Postgres.to_string(),
        message: message.to_string(),
    }
}

/// PostgreSQL engine.
pub struct PostgresEngine {
    url: String,
    capabilities: DialectCapabilities,
    pool: Pool,
    disposed: AtomicBool,
}

impl fmt::Debug for PostgresEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresEngine")
            .field("url", &mask_url(&self.url))
            .field("max_size", &self.pool.status().max_size)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PostgresEngine {
    /// Builds a lazy pool for a `postgresql://` URL.
    pub fn open(url: &str, settings: &PoolSettings) -> Result<Self, EngineError> {
        let mut cfg = Config::new();
        cfg.url = Some(strip_driver_qualifier(url));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Clean,
        });

        let pool = cfg
            .builder(NoTls)
            .map_err(|e| EngineError::Internal {
                message: format!("failed to create pool builder: {e}"),
            })?
            .max_size(settings.max_connections as usize)
            .wait_timeout(Some(settings.connect_timeout()))
            .create_timeout(Some(settings.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(connection_error)?;

        tracing::debug!(url = %mask_url(url), "Created PostgreSQL engine");

        Ok(Self {
            url: url.to_string(),
            capabilities: DialectCapabilities::from_url(url),
            pool,
            disposed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Engine for PostgresEngine {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.capabilities
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed {
                url: self.masked_url(),
            });
        }
        let client = self.pool.get().await.map_err(connection_error)?;
        Ok(Box::new(PostgresConnection {
            client: Some(client),
            in_transaction: false,
        }))
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            tracing::debug!(url = %self.masked_url(), "Disposed PostgreSQL engine");
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => b.to_sql(ty, out),
            SqlValue::Integer(n) => match *ty {
                Type::INT2 => i16::try_from(*n)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*n)?.to_sql(ty, out),
                Type::FLOAT8 => (*n as f64).to_sql(ty, out),
                _ => n.to_sql(ty, out),
            },
            SqlValue::Real(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            SqlValue::Text(s) => s.to_sql(ty, out),
            SqlValue::Blob(b) => b.to_sql(ty, out),
            SqlValue::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn decode(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map(|n| SqlValue::Integer(i64::from(n))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map(|n| SqlValue::Integer(i64::from(n))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Integer),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map(|n| SqlValue::Integer(i64::from(n))),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|f| SqlValue::Real(f64::from(f))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Real),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(SqlValue::Json),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx)?.map(SqlValue::Blob),
        // Everything else must be text-like; cast other types in SQL.
        _ => row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

struct PostgresConnection {
    client: Option<Object>,
    in_transaction: bool,
}

impl PostgresConnection {
    fn client(&self) -> Result<&Object, EngineError> {
        self.client.as_ref().ok_or_else(|| EngineError::Internal {
            message: "connection already released".to_string(),
        })
    }
}

fn bind(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl Connection for PostgresConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), EngineError> {
        self.client()?.batch_execute(sql).await.map_err(statement_error)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, EngineError> {
        let params = bind(params);
        self.client()?
            .execute(sql, &params)
            .await
            .map_err(statement_error)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, EngineError> {
        let params = bind(params);
        let rows = self
            .client()?
            .query(sql, &params)
            .await
            .map_err(statement_error)?;

        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let columns: Arc<[String]> = first
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>()
            .into();

        rows.iter()
            .map(|row| {
                let values = (0..columns.len())
                    .map(|i| decode(row, i))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(statement_error)?;
                Ok(Row::new(columns.clone(), values))
            })
            .collect()
    }

    async fn begin(&mut self) -> Result<(), EngineError> {
        self.client()?.batch_execute("BEGIN").await.map_err(statement_error)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        let result = self.client()?.batch_execute("COMMIT").await;
        self.in_transaction = false;
        result.map_err(statement_error)
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        let result = self.client()?.batch_execute("ROLLBACK").await;
        self.in_transaction = false;
        result.map_err(statement_error)
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

impl Drop for PostgresConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(client) = self.client.take() {
                tracing::warn!("PostgreSQL connection dropped inside a transaction; discarding it");
                drop(Object::take(client));
            }
        }
    }
}
