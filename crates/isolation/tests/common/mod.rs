//! Shared helpers for the isolation integration tests.
//!
//! [`SpyConnector`] hands out engines for any dialect that record every
//! statement instead of talking to a server. Schema and database existence
//! queries are answered from what the recorded DDL created, so providers
//! behave as they would against a real catalog.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use tenantry_isolation::config::{PoolSettings, mask_url};
use tenantry_isolation::dialect::{Dialect, DialectCapabilities};
use tenantry_isolation::engine::{Connection, Connector, Engine, Row, SqlValue};
use tenantry_isolation::error::EngineError;
use tenantry_isolation::metadata::{ColumnDef, ColumnType, ForeignKeyDef, SchemaMetadata, TableDef};

// ============================================================================
// Spy engines
// ============================================================================

#[derive(Debug, Default)]
struct SpyState {
    statements: Vec<String>,
    engines: Vec<String>,
    disposed: Vec<String>,
    schemas: BTreeSet<String>,
    databases: BTreeSet<String>,
    fail_on: Vec<String>,
}

/// Connector whose engines record statements instead of running them.
#[derive(Debug, Clone, Default)]
pub struct SpyConnector {
    state: Arc<Mutex<SpyState>>,
}

impl SpyConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement seen so far, including `BEGIN`/`COMMIT`/`ROLLBACK`.
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Statements that change the catalog.
    pub fn ddl(&self) -> Vec<String> {
        self.statements().into_iter().filter(|s| is_ddl(s)).collect()
    }

    /// Statements containing `needle`.
    pub fn matching(&self, needle: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(needle))
            .collect()
    }

    pub fn clear_statements(&self) {
        self.state.lock().statements.clear();
    }

    /// URLs of every engine created, in order.
    pub fn engines_created(&self) -> Vec<String> {
        self.state.lock().engines.clone()
    }

    /// URLs of every engine disposed, in order.
    pub fn engines_disposed(&self) -> Vec<String> {
        self.state.lock().disposed.clone()
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.state.lock().schemas.contains(name)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.state.lock().databases.contains(name)
    }

    /// Makes every later statement containing `needle` fail. Needles add up.
    pub fn fail_on(&self, needle: &str) {
        self.state.lock().fail_on.push(needle.to_string());
    }
}

impl Connector for SpyConnector {
    fn create_engine(&self, url: &str, _pool: &PoolSettings) -> Result<Arc<dyn Engine>, EngineError> {
        self.state.lock().engines.push(url.to_string());
        Ok(Arc::new(SpyEngine {
            url: url.to_string(),
            capabilities: DialectCapabilities::from_url(url),
            state: self.state.clone(),
            disposed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct SpyEngine {
    url: String,
    capabilities: DialectCapabilities,
    state: Arc<Mutex<SpyState>>,
    disposed: AtomicBool,
}

#[async_trait]
impl Engine for SpyEngine {
    fn capabilities(&self) -> &DialectCapabilities {
        &self.capabilities
    }

    fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, EngineError> {
        if self.is_disposed() {
            return Err(EngineError::Disposed {
                url: mask_url(&self.url),
            });
        }
        Ok(Box::new(SpyConnection {
            dialect: self.capabilities.dialect(),
            state: self.state.clone(),
            in_transaction: false,
            tenant_setting: None,
        }))
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.state.lock().disposed.push(self.url.clone());
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

struct SpyConnection {
    dialect: Dialect,
    state: Arc<Mutex<SpyState>>,
    in_transaction: bool,
    tenant_setting: Option<String>,
}

impl SpyConnection {
    fn record(&self, sql: &str) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());
        match state.fail_on.iter().find(|needle| sql.contains(needle.as_str())) {
            Some(needle) => Err(EngineError::Statement {
                dialect: self.dialect.to_string(),
                message: format!("injected failure on {needle:?}"),
            }),
            None => Ok(()),
        }
    }

    fn apply_ddl(&self, sql: &str) {
        let mut state = self.state.lock();
        if let Some(name) = name_after(sql, "CREATE SCHEMA IF NOT EXISTS ") {
            state.schemas.insert(name);
        } else if let Some(name) = sql
            .strip_prefix("IF SCHEMA_ID(N'")
            .and_then(|rest| rest.split('\'').next())
        {
            state.schemas.insert(name.to_string());
        } else if let Some(name) = name_after(sql, "DROP SCHEMA IF EXISTS ") {
            state.schemas.remove(&name);
        } else if let Some(name) = name_after(sql, "CREATE DATABASE IF NOT EXISTS ")
            .or_else(|| name_after(sql, "CREATE DATABASE "))
        {
            state.databases.insert(name);
        } else if let Some(name) = name_after(sql, "DROP DATABASE IF EXISTS ") {
            state.databases.remove(&name);
        }
    }
}

#[async_trait]
impl Connection for SpyConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn batch_execute(&mut self, sql: &str) -> Result<(), EngineError> {
        self.record(sql)?;
        self.apply_ddl(sql);
        Ok(())
    }

    async fn execute(&mut self, sql: &str, _params: &[SqlValue]) -> Result<u64, EngineError> {
        self.record(sql)?;
        Ok(0)
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, EngineError> {
        self.record(sql)?;
        let first = params.first().and_then(SqlValue::as_str).map(str::to_string);

        if sql.contains("set_config('app.current_tenant'") {
            self.tenant_setting = first;
            return Ok(Vec::new());
        }
        if sql.contains("current_setting(") {
            let value = self.tenant_setting.clone().map_or(SqlValue::Null, SqlValue::Text);
            return Ok(vec![single("tenant", value)]);
        }

        let state = self.state.lock();
        let catalog = if sql.contains("pg_namespace") || sql.contains("sys.schemas") {
            Some(&state.schemas)
        } else if sql.contains("pg_database")
            || sql.contains("information_schema.schemata")
            || sql.contains("sys.databases")
        {
            Some(&state.databases)
        } else {
            None
        };
        match (catalog, first) {
            (Some(names), Some(name)) if names.contains(&name) => {
                Ok(vec![single("?column?", SqlValue::Integer(1))])
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn begin(&mut self) -> Result<(), EngineError> {
        self.record("BEGIN")?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), EngineError> {
        self.record("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), EngineError> {
        self.in_transaction = false;
        self.record("ROLLBACK")
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

fn single(column: &str, value: SqlValue) -> Row {
    Row::new(vec![column.to_string()].into(), vec![value])
}

/// Reads the quoted identifier that directly follows `prefix`.
fn name_after(sql: &str, prefix: &str) -> Option<String> {
    let rest = sql.strip_prefix(prefix)?;
    let mut chars = rest.chars();
    let close = match chars.next()? {
        '"' => '"',
        '`' => '`',
        '[' => ']',
        _ => return None,
    };
    Some(chars.take_while(|c| *c != close).collect())
}

fn is_ddl(sql: &str) -> bool {
    ["CREATE ", "DROP ", "ALTER ", "IF "]
        .iter()
        .any(|keyword| sql.starts_with(keyword))
}

// ============================================================================
// Fixtures
// ============================================================================

/// `orders` and `items` (items reference orders), both tenant-tagged.
pub fn shop_metadata() -> SchemaMetadata {
    SchemaMetadata::new()
        .table(
            TableDef::new("items")
                .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
                .column(ColumnDef::new("tenant_id", ColumnType::Text).not_null())
                .column(ColumnDef::new("order_id", ColumnType::Integer).not_null())
                .column(ColumnDef::new("sku", ColumnType::Text))
                .foreign_key(ForeignKeyDef::new(["order_id"], "orders", ["id"])),
        )
        .table(
            TableDef::new("orders")
                .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
                .column(ColumnDef::new("tenant_id", ColumnType::Text).not_null())
                .column(ColumnDef::new("total", ColumnType::Real)),
        )
}

/// One table without a tenant column.
pub fn notes_metadata() -> SchemaMetadata {
    SchemaMetadata::new().table(
        TableDef::new("notes")
            .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
            .column(ColumnDef::new("body", ColumnType::Text)),
    )
}

/// Identifiers that must never reach DDL.
pub fn hostile_identifiers() -> Vec<String> {
    vec![
        "'; DROP TABLE tenants; --".to_string(),
        "acme\"; DROP SCHEMA public CASCADE; --".to_string(),
        "acme`; DROP DATABASE prod; --".to_string(),
        "acme]; DROP TABLE x; --".to_string(),
        "../../etc/passwd".to_string(),
        "acme corp".to_string(),
        "ACME".to_string(),
        "ac".to_string(),
        "acme-".to_string(),
        "-acme".to_string(),
        "1acme".to_string(),
        "acme_corp".to_string(),
        "acme\0corp".to_string(),
        "acme\ncorp".to_string(),
        "acmé".to_string(),
        "a".repeat(64),
        "a".repeat(10_000),
        String::new(),
        json!({"tenant": "acme"}).to_string(),
    ]
}
