//! Shared-table isolation.
//!
//! On PostgreSQL every session sets the tenant session variable and the
//! engine's row-level security policies (see
//! [`RowLevelSecurityIsolation::install_policies`]) filter every statement.
//! Elsewhere the tenant predicate added by
//! [`apply_filter`](IsolationProvider::apply_filter) is the only barrier, so
//! sessions refuse structured queries that did not go through it. Raw SQL
//! run on a session is not inspected.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{IsolationStrategy, TenancyConfig};
use crate::dialect::{Dialect, DialectCapabilities, session_variable_literal};
use crate::engine::{Connection, Connector, Engine, SqlValue};
use crate::error::{IdentifierError, IsolationError, TenancyResult};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::tenant::Tenant;
use crate::validation::{
    assert_safe_column_name, assert_safe_table_name, assert_safe_tenant_identifier, quote_identifier,
};

use super::session::{SessionNamespace, TenantSession};
use super::{DdlTarget, DestroyScope, IsolationProvider, Lifecycle, ProviderState};

/// Name of the policy created by `install_policies`.
pub const POLICY_NAME: &str = "tenant_isolation";

/// Row-level isolation over shared tables.
pub struct RowLevelSecurityIsolation {
    config: Arc<TenancyConfig>,
    capabilities: DialectCapabilities,
    engine: Arc<dyn Engine>,
    owns_engine: bool,
    native: bool,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for RowLevelSecurityIsolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowLevelSecurityIsolation")
            .field("engine", &self.engine.masked_url())
            .field("native", &self.native)
            .field("tenant_column", &self.config.tenant_column)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl RowLevelSecurityIsolation {
    /// Creates the provider with its own engine.
    pub fn new(config: Arc<TenancyConfig>, connector: Arc<dyn Connector>) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Rls)?;
        let engine = connector
            .create_engine(&config.database_url, &config.pool)
            .map_err(|e| IsolationError::setup("create shared engine", e))?;
        Ok(Self::build(config, engine, true))
    }

    /// Creates the provider on an engine owned by someone else.
    pub fn with_engine(config: Arc<TenancyConfig>, engine: Arc<dyn Engine>) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Rls)?;
        Ok(Self::build(config, engine, false))
    }

    fn build(config: Arc<TenancyConfig>, engine: Arc<dyn Engine>, owns_engine: bool) -> Self {
        let capabilities = engine.capabilities().clone();
        let native = capabilities.supports_native_row_level_security();
        let provider = Self {
            config,
            capabilities,
            engine,
            owns_engine,
            native,
            lifecycle: Lifecycle::new(),
        };
        provider.lifecycle.mark_ready();
        if native {
            info!(dialect = %provider.dialect(), "Row-level isolation ready");
        } else {
            warn!(
                dialect = %provider.dialect(),
                tenant_column = %provider.config.tenant_column,
                "No native row-level security; queries must pass through apply_filter"
            );
        }
        provider
    }

    /// Whether the engine enforces the policies itself.
    pub fn is_native(&self) -> bool {
        self.native
    }

    /// Renders the policy statements for `tables`.
    pub fn policy_statements(&self, tables: &[&str]) -> Result<Vec<String>, IdentifierError> {
        let dialect = self.dialect();
        let column = &self.config.tenant_column;
        assert_safe_column_name(column, "install row-level policies")?;
        let variable = session_variable_literal(&self.config.tenant_session_variable).ok_or_else(|| {
            IdentifierError::InvalidColumnName {
                value: self.config.tenant_session_variable.clone(),
                context: "tenant session variable".to_string(),
            }
        })?;

        let predicate = format!(
            "{} = current_setting('{variable}', true)",
            quote_identifier(dialect, column)
        );
        let mut statements = Vec::with_capacity(tables.len() * 4);
        for table in tables {
            assert_safe_table_name(table, "install row-level policies")?;
            let table = quote_identifier(dialect, table);
            statements.push(format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY"));
            statements.push(format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"));
            statements.push(format!("DROP POLICY IF EXISTS {POLICY_NAME} ON {table}"));
            statements.push(format!(
                "CREATE POLICY {POLICY_NAME} ON {table} USING ({predicate}) WITH CHECK ({predicate})"
            ));
        }
        Ok(statements)
    }

    /// Enables row-level security on `tables`. A no-op, with a warning,
    /// on engines without native support.
    pub async fn install_policies(&self, tables: &[&str]) -> TenancyResult<()> {
        let op = "install_policies";
        self.lifecycle.ensure_open()?;
        if !self.native {
            warn!(dialect = %self.dialect(), "Row-level security policies are not supported here; skipping");
            return Ok(());
        }

        let statements = self.policy_statements(tables)?;
        let mut conn = self
            .engine
            .connect()
            .await
            .map_err(|e| IsolationError::setup(op, e))?;
        conn.begin().await.map_err(|e| IsolationError::setup(op, e))?;
        for sql in &statements {
            if let Err(e) = conn.batch_execute(sql).await {
                if let Err(rollback) = conn.rollback().await {
                    warn!(operation = op, error = %rollback, "Rollback failed");
                }
                return Err(IsolationError::setup(op, e).into());
            }
        }
        conn.commit().await.map_err(|e| IsolationError::setup(op, e))?;
        info!(tables = tables.len(), "Installed row-level security policies");
        Ok(())
    }

    async fn bind_tenant(
        &self,
        op: &str,
        conn: &mut Box<dyn Connection>,
        tenant: &Tenant,
    ) -> TenancyResult<()> {
        if !self.native {
            return Ok(());
        }
        let statement = self
            .capabilities
            .set_tenant_session_variable_statement(&self.config.tenant_session_variable)
            .ok_or_else(|| {
                IsolationError::message(op, tenant.id(), "tenant session variable is not a dotted identifier")
            })?;
        conn.query(&statement, &[SqlValue::from(tenant.id())])
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(())
    }

    async fn connect(&self, op: &str, tenant: &Tenant) -> TenancyResult<Box<dyn Connection>> {
        let mut conn = self
            .engine
            .connect()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        self.bind_tenant(op, &mut conn, tenant).await?;
        Ok(conn)
    }
}

#[async_trait]
impl IsolationProvider for RowLevelSecurityIsolation {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Rls
    }

    fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    fn dialect(&self) -> Dialect {
        self.capabilities.dialect()
    }

    async fn acquire_session(&self, tenant: &Tenant) -> TenancyResult<TenantSession> {
        self.lifecycle.ensure_open()?;
        let conn = self.connect("acquire_session", tenant).await?;
        Ok(TenantSession::new(
            conn,
            tenant.id().clone(),
            IsolationStrategy::Rls,
            SessionNamespace::Shared {
                tenant_column: self.config.tenant_column.clone(),
                enforce_filter: !self.native,
            },
        ))
    }

    async fn apply_filter(&self, query: Query, tenant: &Tenant) -> TenancyResult<Query> {
        self.lifecycle.ensure_open()?;
        Ok(query.with_tenant_filter(self.config.tenant_column.as_str(), tenant.id()))
    }

    async fn initialize_tenant(
        &self,
        tenant: &Tenant,
        metadata: Option<&SchemaMetadata>,
    ) -> TenancyResult<()> {
        let op = "initialize_tenant";
        self.lifecycle.ensure_open()?;
        assert_safe_tenant_identifier(tenant.identifier(), &format!("tenant {}", tenant.id()))?;

        let statements = match metadata {
            Some(metadata) => metadata.create_statements(self.dialect(), None)?,
            None => Vec::new(),
        };
        if !statements.is_empty() {
            let mut conn = self
                .engine
                .connect()
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
            conn.begin()
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
            for sql in &statements {
                if let Err(e) = conn.batch_execute(sql).await {
                    if let Err(rollback) = conn.rollback().await {
                        warn!(tenant_id = %tenant.id(), operation = op, error = %rollback, "Rollback failed");
                    }
                    return Err(IsolationError::failed(op, tenant.id(), e).into());
                }
            }
            conn.commit()
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        }

        info!(tenant_id = %tenant.id(), "Initialized tenant on shared tables");
        Ok(())
    }

    async fn destroy_tenant(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()> {
        let op = "destroy_tenant";
        self.lifecycle.ensure_open()?;
        let column = self.config.tenant_column.as_str();

        let mut tables: Vec<String> = scope.table_list().to_vec();
        if let Some(metadata) = scope.schema_metadata() {
            for table in metadata.tenant_tables(column) {
                if !tables.iter().any(|t| t == table) {
                    tables.push(table.to_string());
                }
            }
        }
        if tables.is_empty() {
            return Err(IsolationError::DestroyScopeRequired {
                tenant_id: tenant.id().clone(),
            }
            .into());
        }

        let context = format!("destroy tenant {}", tenant.id());
        assert_safe_column_name(column, &context)?;
        for table in &tables {
            assert_safe_table_name(table, &context)?;
        }

        let dialect = self.dialect();
        let predicate = format!(
            "{} = {}",
            quote_identifier(dialect, column),
            dialect.placeholder(1)
        );
        let statements: Vec<String> = tables
            .iter()
            .map(|t| format!("DELETE FROM {} WHERE {predicate}", quote_identifier(dialect, t)))
            .collect();

        warn!(tenant_id = %tenant.id(), tables = tables.len(), "Deleting tenant rows");

        let mut conn = self.connect(op, tenant).await?;
        conn.begin()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        let mut deleted = 0u64;
        for sql in &statements {
            match conn.execute(sql, &[SqlValue::from(tenant.id())]).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    if let Err(rollback) = conn.rollback().await {
                        warn!(tenant_id = %tenant.id(), operation = op, error = %rollback, "Rollback failed");
                    }
                    return Err(IsolationError::failed(op, tenant.id(), e).into());
                }
            }
        }
        conn.commit()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;

        warn!(tenant_id = %tenant.id(), rows = deleted, "Deleted tenant rows");
        Ok(())
    }

    async fn verify_isolation(&self, tenant: &Tenant) -> TenancyResult<bool> {
        let op = "verify_isolation";
        self.lifecycle.ensure_open()?;
        let mut conn = self.connect(op, tenant).await?;
        if !self.native {
            return Ok(true);
        }

        let Some(variable) = session_variable_literal(&self.config.tenant_session_variable) else {
            return Ok(false);
        };
        let sql = format!("SELECT current_setting('{variable}', true) AS tenant");
        let rows = conn
            .query(&sql, &[])
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .and_then(SqlValue::as_str)
            == Some(tenant.id().as_str()))
    }

    fn ddl_target(&self, _tenant: &Tenant) -> TenancyResult<DdlTarget> {
        Ok(DdlTarget::Shared)
    }

    fn pool_count(&self) -> usize {
        usize::from(self.owns_engine)
    }

    async fn close(&self) {
        if !self.lifecycle.mark_closed() {
            return;
        }
        if self.owns_engine {
            self.engine.dispose().await;
        }
        info!("Row-level isolation closed");
    }
}
