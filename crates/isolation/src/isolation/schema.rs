//! Schema-per-tenant isolation.
//!
//! Three modes, picked from the dialect once at construction:
//!
//! * **native** (PostgreSQL, SQL Server): `CREATE SCHEMA` per tenant; sessions
//!   point their search path at it and structured queries are qualified.
//! * **prefix** (SQLite, unknown engines): tenant tables live side by side
//!   in the shared database, renamed with a per-tenant prefix.
//! * **delegated** (MySQL, where a schema is a database): every call goes to
//!   an inner [`DatabaseIsolation`] that shares this provider's engine as its
//!   master.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::{IsolationStrategy, TenancyConfig};
use crate::dialect::{Dialect, DialectCapabilities, prefix_of_table};
use crate::engine::{Connection, Connector, Engine, SqlValue};
use crate::error::{EngineError, IsolationError, TenancyResult};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::tenant::{Tenant, TenantContext};
use crate::validation::{
    assert_safe_schema_name, assert_safe_table_name, assert_safe_tenant_identifier, quote_identifier,
};

use super::database::DatabaseIsolation;
use super::session::{SessionNamespace, TenantSession};
use super::{DdlTarget, DestroyScope, IsolationProvider, Lifecycle, ProviderState};

const SQLITE_TABLES: &str = "SELECT name FROM sqlite_master WHERE type = 'table'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Native,
    Prefix,
    Delegated,
}

/// One namespace per tenant inside one database.
pub struct SchemaIsolation {
    config: Arc<TenancyConfig>,
    capabilities: DialectCapabilities,
    engine: Arc<dyn Engine>,
    owns_engine: bool,
    mode: Mode,
    delegate: Option<DatabaseIsolation>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for SchemaIsolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaIsolation")
            .field("engine", &self.engine.masked_url())
            .field("mode", &self.mode)
            .field("owns_engine", &self.owns_engine)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl SchemaIsolation {
    /// Creates the provider with its own engine.
    pub fn new(config: Arc<TenancyConfig>, connector: Arc<dyn Connector>) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Schema)?;
        let engine = connector
            .create_engine(&config.database_url, &config.pool)
            .map_err(|e| IsolationError::setup("create schema engine", e))?;
        Self::build(config, engine, connector, true)
    }

    /// Creates the provider on an engine owned by someone else.
    pub fn with_engine(
        config: Arc<TenancyConfig>,
        engine: Arc<dyn Engine>,
        connector: Arc<dyn Connector>,
    ) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Schema)?;
        Self::build(config, engine, connector, false)
    }

    fn build(
        config: Arc<TenancyConfig>,
        engine: Arc<dyn Engine>,
        connector: Arc<dyn Connector>,
        owns_engine: bool,
    ) -> TenancyResult<Self> {
        let capabilities = engine.capabilities().clone();
        let (mode, delegate) = if capabilities.schema_is_database_synonym() {
            let delegate = DatabaseIsolation::with_master(config.clone(), engine.clone(), connector)?;
            (Mode::Delegated, Some(delegate))
        } else if capabilities.supports_native_schemas() {
            (Mode::Native, None)
        } else {
            (Mode::Prefix, None)
        };

        let provider = Self {
            config,
            capabilities,
            engine,
            owns_engine,
            mode,
            delegate,
            lifecycle: Lifecycle::new(),
        };
        provider.lifecycle.mark_ready();

        match mode {
            Mode::Native => info!(dialect = %provider.dialect(), "Schema isolation ready"),
            Mode::Prefix => info!(
                dialect = %provider.dialect(),
                "Schema isolation ready; no native schemas, using table prefixes"
            ),
            Mode::Delegated => info!(
                dialect = %provider.dialect(),
                "Schema isolation ready; schemas are databases here, delegating"
            ),
        }
        Ok(provider)
    }

    /// Whether tenants get a native schema.
    pub fn uses_native_schemas(&self) -> bool {
        self.mode == Mode::Native
    }

    /// Whether tenants get prefixed tables.
    pub fn uses_table_prefixes(&self) -> bool {
        self.mode == Mode::Prefix
    }

    /// Whether every call is delegated to database isolation.
    pub fn is_delegating(&self) -> bool {
        self.mode == Mode::Delegated
    }

    /// Validated schema name for a tenant. A per-tenant override is
    /// re-validated like a derived name.
    pub fn schema_name_for(&self, tenant: &Tenant) -> TenancyResult<String> {
        let context = format!("schema for tenant {}", tenant.id());
        if let Some(schema) = tenant.schema_name() {
            assert_safe_schema_name(schema, &context)?;
            return Ok(schema.to_string());
        }
        assert_safe_tenant_identifier(tenant.identifier(), &context)?;
        let schema = self.config.schema_name_for(tenant.identifier());
        assert_safe_schema_name(&schema, &context)?;
        Ok(schema)
    }

    /// Validated table-name prefix for a tenant.
    pub fn table_prefix_for(&self, tenant: &Tenant) -> TenancyResult<String> {
        let context = format!("table prefix for tenant {}", tenant.id());
        assert_safe_tenant_identifier(tenant.identifier(), &context)?;
        let prefix = self.capabilities.table_name_prefix(tenant.identifier());
        assert_safe_table_name(&prefix, &context)?;
        Ok(prefix)
    }

    pub(crate) async fn dispose_tenant_engines(&self) {
        if let Some(delegate) = &self.delegate {
            delegate.dispose_tenant_engines().await;
        }
    }

    async fn connect(&self, op: &str, tenant: &Tenant) -> TenancyResult<Box<dyn Connection>> {
        self.engine
            .connect()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e).into())
    }

    async fn prefixed_tables(
        &self,
        conn: &mut Box<dyn Connection>,
        prefix: &str,
    ) -> Result<Vec<String>, EngineError> {
        let rows = conn.query(SQLITE_TABLES, &[]).await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get_index(0).and_then(SqlValue::as_str))
            .filter(|name| prefix_of_table(name) == Some(prefix))
            .map(str::to_string)
            .collect())
    }

    /// Logical tables of a destroy scope, referencing tables last.
    fn scope_tables(scope: &DestroyScope) -> Vec<String> {
        let mut tables: Vec<String> = scope
            .schema_metadata()
            .map(|m| m.sorted_tables().into_iter().rev().map(|t| t.name.clone()).collect())
            .unwrap_or_default();
        for table in scope.table_list() {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        tables
    }

    async fn run_in_transaction(
        conn: &mut Box<dyn Connection>,
        statements: &[String],
    ) -> Result<(), EngineError> {
        conn.begin().await?;
        for sql in statements {
            if let Err(e) = conn.batch_execute(sql).await {
                if let Err(rollback) = conn.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                return Err(e);
            }
        }
        conn.commit().await
    }

    async fn destroy_prefixed(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()> {
        let op = "destroy_tenant";
        let prefix = self.table_prefix_for(tenant)?;
        let dialect = self.dialect();
        let mut conn = self.connect(op, tenant).await?;

        let mut tables: Vec<String> = Self::scope_tables(scope)
            .into_iter()
            .map(|t| format!("{prefix}{t}"))
            .collect();
        if dialect == Dialect::Sqlite {
            let existing = self
                .prefixed_tables(&mut conn, &prefix)
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
            for table in existing {
                if !tables.contains(&table) {
                    tables.push(table);
                }
            }
        } else if tables.is_empty() {
            return Err(IsolationError::DestroyScopeRequired {
                tenant_id: tenant.id().clone(),
            }
            .into());
        }

        let context = format!("destroy tenant {}", tenant.id());
        for table in &tables {
            assert_safe_table_name(table, &context)?;
        }
        let statements: Vec<String> = tables
            .iter()
            .map(|t| format!("DROP TABLE IF EXISTS {}", quote_identifier(dialect, t)))
            .collect();

        warn!(tenant_id = %tenant.id(), prefix = %prefix, tables = tables.len(), "Dropping tenant tables");

        // Foreign-key enforcement cannot change inside a transaction.
        let sqlite = dialect == Dialect::Sqlite;
        if sqlite {
            conn.batch_execute("PRAGMA foreign_keys = OFF")
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        }
        let result = Self::run_in_transaction(&mut conn, &statements).await;
        if sqlite {
            if let Err(e) = conn.batch_execute("PRAGMA foreign_keys = ON").await {
                warn!(error = %e, "Could not re-enable foreign keys");
            }
        }
        result.map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(())
    }

    async fn destroy_native(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()> {
        let op = "destroy_tenant";
        let schema = self.schema_name_for(tenant)?;
        let dialect = self.dialect();

        let mut statements = Vec::new();
        // SQL Server cannot drop a schema that still has objects in it.
        if dialect == Dialect::SqlServer {
            let context = format!("destroy tenant {}", tenant.id());
            for table in Self::scope_tables(scope) {
                assert_safe_table_name(&table, &context)?;
                statements.push(format!(
                    "DROP TABLE IF EXISTS {}.{}",
                    quote_identifier(dialect, &schema),
                    quote_identifier(dialect, &table)
                ));
            }
        }
        statements.extend(dialect.drop_schema_statement(&schema));

        warn!(tenant_id = %tenant.id(), schema = %schema, "Dropping tenant schema");
        let mut conn = self.connect(op, tenant).await?;
        Self::run_in_transaction(&mut conn, &statements)
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(())
    }
}

#[async_trait]
impl IsolationProvider for SchemaIsolation {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Schema
    }

    fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    fn dialect(&self) -> Dialect {
        self.capabilities.dialect()
    }

    async fn acquire_session(&self, tenant: &Tenant) -> TenancyResult<TenantSession> {
        let op = "acquire_session";
        self.lifecycle.ensure_open()?;

        if let Some(delegate) = &self.delegate {
            let session = delegate.acquire_session(tenant).await?;
            return Ok(session.relabel(IsolationStrategy::Schema));
        }

        if self.mode == Mode::Prefix {
            let prefix = self.table_prefix_for(tenant)?;
            let conn = self.connect(op, tenant).await?;
            // Outside a tenant scope there is nowhere to publish the prefix.
            let _ = TenantContext::set_metadata("table_prefix", json!(prefix));
            return Ok(TenantSession::new(
                conn,
                tenant.id().clone(),
                IsolationStrategy::Schema,
                SessionNamespace::TablePrefix(prefix),
            ));
        }

        let schema = self.schema_name_for(tenant)?;
        let mut conn = self.connect(op, tenant).await?;
        let activated = match self.capabilities.schema_activation_statement() {
            Some(statement) => {
                let search_path = format!("{schema},{}", self.config.public_schema);
                conn.query(statement, &[SqlValue::from(search_path)])
                    .await
                    .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
                true
            }
            None => false,
        };
        debug!(tenant_id = %tenant.id(), schema = %schema, "Acquired schema session");
        Ok(TenantSession::new(
            conn,
            tenant.id().clone(),
            IsolationStrategy::Schema,
            SessionNamespace::Schema {
                name: schema,
                activated,
            },
        ))
    }

    async fn apply_filter(&self, query: Query, _tenant: &Tenant) -> TenancyResult<Query> {
        self.lifecycle.ensure_open()?;
        Ok(query)
    }

    async fn initialize_tenant(
        &self,
        tenant: &Tenant,
        metadata: Option<&SchemaMetadata>,
    ) -> TenancyResult<()> {
        let op = "initialize_tenant";
        self.lifecycle.ensure_open()?;

        if let Some(delegate) = &self.delegate {
            return delegate.initialize_tenant(tenant, metadata).await;
        }

        let dialect = self.dialect();
        let (namespace, statements) = match self.mode {
            Mode::Native => {
                let schema = self.schema_name_for(tenant)?;
                let mut statements: Vec<String> =
                    dialect.create_schema_statement(&schema).into_iter().collect();
                if let Some(metadata) = metadata {
                    statements.extend(metadata.create_statements(dialect, Some(&schema))?);
                }
                (schema, statements)
            }
            _ => {
                let prefix = self.table_prefix_for(tenant)?;
                let statements = match metadata {
                    Some(metadata) => metadata
                        .with_table_prefix(&prefix)
                        .create_statements(dialect, None)?,
                    None => Vec::new(),
                };
                (prefix, statements)
            }
        };

        if !statements.is_empty() {
            let mut conn = self.connect(op, tenant).await?;
            Self::run_in_transaction(&mut conn, &statements)
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        }

        info!(
            tenant_id = %tenant.id(),
            namespace = %namespace,
            statements = statements.len(),
            "Initialized tenant schema"
        );
        Ok(())
    }

    async fn destroy_tenant(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()> {
        self.lifecycle.ensure_open()?;
        match (&self.delegate, self.mode) {
            (Some(delegate), _) => delegate.destroy_tenant(tenant, scope).await,
            (None, Mode::Native) => self.destroy_native(tenant, scope).await,
            (None, _) => self.destroy_prefixed(tenant, scope).await,
        }
    }

    async fn verify_isolation(&self, tenant: &Tenant) -> TenancyResult<bool> {
        let op = "verify_isolation";
        self.lifecycle.ensure_open()?;

        if let Some(delegate) = &self.delegate {
            return delegate.verify_isolation(tenant).await;
        }

        if self.mode == Mode::Prefix {
            let prefix = self.table_prefix_for(tenant)?;
            let mut conn = self.connect(op, tenant).await?;
            if self.dialect() != Dialect::Sqlite {
                return Ok(true);
            }
            let tables = self
                .prefixed_tables(&mut conn, &prefix)
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
            return Ok(!tables.is_empty());
        }

        let schema = self.schema_name_for(tenant)?;
        let Some(exists) = self.dialect().schema_exists_query() else {
            return Ok(false);
        };
        let mut conn = self.connect(op, tenant).await?;
        let rows = conn
            .query(exists, &[SqlValue::from(schema)])
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(!rows.is_empty())
    }

    fn ddl_target(&self, tenant: &Tenant) -> TenancyResult<DdlTarget> {
        match (&self.delegate, self.mode) {
            (Some(delegate), _) => delegate.ddl_target(tenant),
            (None, Mode::Native) => Ok(DdlTarget::Schema {
                name: self.schema_name_for(tenant)?,
            }),
            (None, _) => Ok(DdlTarget::TablePrefix {
                prefix: self.table_prefix_for(tenant)?,
            }),
        }
    }

    fn pool_count(&self) -> usize {
        usize::from(self.owns_engine) + self.delegate.as_ref().map_or(0, |d| d.pool_count())
    }

    async fn close(&self) {
        if !self.lifecycle.mark_closed() {
            return;
        }
        if let Some(delegate) = &self.delegate {
            delegate.close().await;
        }
        if self.owns_engine {
            self.engine.dispose().await;
        }
        info!("Schema isolation closed");
    }
}
