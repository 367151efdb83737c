//! Database-per-tenant isolation.
//!
//! Every tenant gets a dedicated database: a `CREATE DATABASE` on server
//! engines, a separate file on SQLite. Tenant engines are created lazily on
//! first use and cached. Creation is guarded by a per-tenant async lock
//! (check, lock, re-check, create) so a stampede of first requests for a new
//! tenant still builds exactly one pool.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{IsolationStrategy, TenancyConfig, sqlite_file_path};
use crate::dialect::{Dialect, DialectCapabilities};
use crate::engine::{Connector, Engine, SqlValue};
use crate::error::{IsolationError, TenancyResult};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::tenant::{Tenant, TenantId};
use crate::validation::{assert_safe_database_name, assert_safe_tenant_identifier, quote_identifier};

use super::session::{SessionNamespace, TenantSession};
use super::{DdlTarget, DestroyScope, IsolationProvider, Lifecycle, ProviderState};

/// Files SQLite may leave next to a database.
const SQLITE_SIDECARS: [&str; 4] = ["", "-wal", "-shm", "-journal"];

/// One physical database per tenant.
pub struct DatabaseIsolation {
    config: Arc<TenancyConfig>,
    connector: Arc<dyn Connector>,
    master: Arc<dyn Engine>,
    owns_master: bool,
    engines: RwLock<HashMap<TenantId, Arc<dyn Engine>>>,
    creation_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for DatabaseIsolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseIsolation")
            .field("master", &self.master.masked_url())
            .field("owns_master", &self.owns_master)
            .field("tenant_engines", &self.engines.read().len())
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl DatabaseIsolation {
    /// Creates the provider with its own master engine.
    pub fn new(config: Arc<TenancyConfig>, connector: Arc<dyn Connector>) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Database)?;
        let master = connector
            .create_engine(&config.database_url, &config.pool)
            .map_err(|e| IsolationError::setup("create master engine", e))?;
        Ok(Self::build(config, connector, master, true))
    }

    /// Creates the provider on a master engine owned by someone else.
    ///
    /// [`close`](IsolationProvider::close) disposes the tenant engines but
    /// leaves `master` alone.
    pub fn with_master(
        config: Arc<TenancyConfig>,
        master: Arc<dyn Engine>,
        connector: Arc<dyn Connector>,
    ) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Database)?;
        Ok(Self::build(config, connector, master, false))
    }

    fn build(
        config: Arc<TenancyConfig>,
        connector: Arc<dyn Connector>,
        master: Arc<dyn Engine>,
        owns_master: bool,
    ) -> Self {
        let provider = Self {
            config,
            connector,
            master,
            owns_master,
            engines: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
        };
        provider.lifecycle.mark_ready();
        info!(
            master = %provider.master.masked_url(),
            dialect = %provider.master.dialect(),
            "Database isolation ready"
        );
        provider
    }

    /// Validated database name for a tenant.
    pub fn database_name_for(&self, tenant: &Tenant) -> TenancyResult<String> {
        let context = format!("database for tenant {}", tenant.id());
        assert_safe_tenant_identifier(tenant.identifier(), &context)?;
        let name = self.config.database_name_for(tenant.identifier());
        assert_safe_database_name(&name, &context)?;
        Ok(name)
    }

    /// Connection URL of the tenant's database.
    pub fn database_url_for(&self, tenant: &Tenant) -> TenancyResult<String> {
        self.database_name_for(tenant)?;
        Ok(self.config.database_url_for(tenant)?)
    }

    /// Number of cached tenant engines.
    pub fn tenant_engine_count(&self) -> usize {
        self.engines.read().len()
    }

    /// Returns the tenant's engine, creating it on first use.
    pub async fn engine_for(&self, tenant: &Tenant) -> TenancyResult<Arc<dyn Engine>> {
        self.lifecycle.ensure_open()?;
        if let Some(engine) = self.engines.read().get(tenant.id()) {
            return Ok(engine.clone());
        }

        let lock = self
            .creation_locks
            .lock()
            .entry(tenant.id().clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        if let Some(engine) = self.engines.read().get(tenant.id()) {
            return Ok(engine.clone());
        }
        self.lifecycle.ensure_open()?;

        let url = self.database_url_for(tenant)?;
        let engine = self
            .connector
            .create_engine(&url, &self.config.pool)
            .map_err(|e| IsolationError::failed("create tenant engine", tenant.id(), e))?;
        self.engines.write().insert(tenant.id().clone(), engine.clone());
        debug!(tenant_id = %tenant.id(), url = %engine.masked_url(), "Created tenant engine");
        Ok(engine)
    }

    /// Disposes every cached tenant engine. The master is left alone.
    pub(crate) async fn dispose_tenant_engines(&self) {
        let engines: Vec<_> = self.engines.write().drain().collect();
        self.creation_locks.lock().clear();
        for (tenant_id, engine) in engines {
            engine.dispose().await;
            debug!(tenant_id = %tenant_id, "Disposed tenant engine");
        }
    }

    async fn create_database(&self, tenant: &Tenant, name: &str, dialect: Dialect) -> TenancyResult<()> {
        let op = "initialize_tenant";
        let mut conn = self
            .master
            .connect()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;

        if let Some(exists) = dialect.database_exists_query() {
            let rows = conn
                .query(exists, &[SqlValue::from(name)])
                .await
                .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
            if !rows.is_empty() {
                debug!(tenant_id = %tenant.id(), database = %name, "Tenant database already exists");
                return Ok(());
            }
        }

        let quoted = quote_identifier(dialect, name);
        let sql = match dialect {
            Dialect::MySql => format!(
                "CREATE DATABASE IF NOT EXISTS {quoted} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci"
            ),
            _ => format!("CREATE DATABASE {quoted}"),
        };
        match conn.batch_execute(&sql).await {
            Ok(()) => {
                info!(tenant_id = %tenant.id(), database = %name, "Created tenant database");
                Ok(())
            }
            // Lost a race with a concurrent initializer.
            Err(e) if e.to_string().contains("already exists") => {
                debug!(tenant_id = %tenant.id(), database = %name, "Tenant database already exists");
                Ok(())
            }
            Err(e) => Err(IsolationError::failed(op, tenant.id(), e).into()),
        }
    }

    async fn drop_database(&self, tenant: &Tenant, name: &str, dialect: Dialect) -> TenancyResult<()> {
        let op = "destroy_tenant";
        let mut conn = self
            .master
            .connect()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;

        if dialect == Dialect::Postgres {
            // DROP DATABASE fails while other sessions are connected.
            conn.query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[SqlValue::from(name)],
            )
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        }

        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(dialect, name));
        conn.batch_execute(&sql)
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;
        Ok(())
    }
}

fn sidecar_path(path: &std::path::Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

#[async_trait]
impl IsolationProvider for DatabaseIsolation {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Database
    }

    fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    fn dialect(&self) -> Dialect {
        self.master.dialect()
    }

    async fn acquire_session(&self, tenant: &Tenant) -> TenancyResult<TenantSession> {
        self.lifecycle.ensure_open()?;
        let name = self.database_name_for(tenant)?;
        let engine = self.engine_for(tenant).await?;
        let conn = engine
            .connect()
            .await
            .map_err(|e| IsolationError::failed("acquire_session", tenant.id(), e))?;
        Ok(TenantSession::new(
            conn,
            tenant.id().clone(),
            IsolationStrategy::Database,
            SessionNamespace::Database { name },
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
        let name = self.database_name_for(tenant)?;
        let url = self.config.database_url_for(tenant)?;
        let caps = DialectCapabilities::from_url(&url);
        let statements = metadata
            .map(|m| m.create_statements(caps.dialect(), None))
            .transpose()?;

        if !caps.supports_online_database_creation() {
            return Err(IsolationError::ManualSetupRequired {
                operation: op.to_string(),
                tenant_id: tenant.id().clone(),
                dialect: caps.dialect().to_string(),
                message: format!("create database {name} out of band, then retry"),
            }
            .into());
        }

        match caps.dialect() {
            Dialect::Sqlite => {
                let parent = sqlite_file_path(&url)
                    .and_then(|path| path.parent().map(PathBuf::from))
                    .filter(|parent| !parent.as_os_str().is_empty());
                if let Some(parent) = parent {
                    std::fs::create_dir_all(&parent).map_err(|e| {
                        IsolationError::message(
                            op,
                            tenant.id(),
                            format!("cannot create {}: {e}", parent.display()),
                        )
                    })?;
                }
            }
            dialect if tenant.database_url().is_none() => {
                self.create_database(tenant, &name, dialect).await?;
            }
            _ => debug!(tenant_id = %tenant.id(), "Tenant database is externally managed"),
        }

        let engine = self.engine_for(tenant).await?;
        let mut conn = engine
            .connect()
            .await
            .map_err(|e| IsolationError::failed(op, tenant.id(), e))?;

        if let Some(statements) = statements.filter(|s| !s.is_empty()) {
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

        info!(tenant_id = %tenant.id(), database = %name, "Initialized tenant database");
        Ok(())
    }

    async fn destroy_tenant(&self, tenant: &Tenant, _scope: &DestroyScope) -> TenancyResult<()> {
        let op = "destroy_tenant";
        self.lifecycle.ensure_open()?;
        let name = self.database_name_for(tenant)?;
        let url = self.config.database_url_for(tenant)?;
        let caps = DialectCapabilities::from_url(&url);

        warn!(tenant_id = %tenant.id(), database = %name, "Destroying tenant database");

        let engine = self.engines.write().remove(tenant.id());
        if let Some(engine) = engine {
            engine.dispose().await;
        }
        self.creation_locks.lock().remove(tenant.id());

        match caps.dialect() {
            Dialect::Sqlite => {
                if let Some(path) = sqlite_file_path(&url) {
                    for suffix in SQLITE_SIDECARS {
                        let file = sidecar_path(&path, suffix);
                        match std::fs::remove_file(&file) {
                            Ok(()) => debug!(file = %file.display(), "Removed tenant database file"),
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(IsolationError::message(
                                    op,
                                    tenant.id(),
                                    format!("cannot remove {}: {e}", file.display()),
                                )
                                .into());
                            }
                        }
                    }
                }
            }
            _ if tenant.database_url().is_some() => {
                warn!(tenant_id = %tenant.id(), "Tenant database is externally managed; not dropped");
            }
            dialect @ (Dialect::Postgres | Dialect::MySql) => {
                self.drop_database(tenant, &name, dialect).await?;
            }
            dialect => {
                return Err(IsolationError::ManualSetupRequired {
                    operation: op.to_string(),
                    tenant_id: tenant.id().clone(),
                    dialect: dialect.to_string(),
                    message: format!("drop database {name} out of band"),
                }
                .into());
            }
        }

        warn!(tenant_id = %tenant.id(), database = %name, "Destroyed tenant database");
        Ok(())
    }

    async fn verify_isolation(&self, tenant: &Tenant) -> TenancyResult<bool> {
        self.lifecycle.ensure_open()?;
        let name = self.database_name_for(tenant)?;
        let url = self.config.database_url_for(tenant)?;
        let caps = DialectCapabilities::from_url(&url);

        if caps.dialect() == Dialect::Sqlite {
            return Ok(if caps.is_in_memory() {
                self.engines.read().contains_key(tenant.id())
            } else {
                sqlite_file_path(&url).is_some_and(|path| path.exists())
            });
        }

        if tenant.database_url().is_some() {
            let engine = self.engine_for(tenant).await?;
            return Ok(engine.connect().await.is_ok());
        }

        let Some(exists) = caps.dialect().database_exists_query() else {
            return Ok(false);
        };
        let mut conn = self
            .master
            .connect()
            .await
            .map_err(|e| IsolationError::failed("verify_isolation", tenant.id(), e))?;
        let rows = conn
            .query(exists, &[SqlValue::from(name.as_str())])
            .await
            .map_err(|e| IsolationError::failed("verify_isolation", tenant.id(), e))?;
        Ok(!rows.is_empty())
    }

    fn ddl_target(&self, tenant: &Tenant) -> TenancyResult<DdlTarget> {
        Ok(DdlTarget::Database {
            url: self.database_url_for(tenant)?,
        })
    }

    fn pool_count(&self) -> usize {
        usize::from(self.owns_master) + self.engines.read().len()
    }

    async fn close(&self) {
        if !self.lifecycle.mark_closed() {
            return;
        }
        self.dispose_tenant_engines().await;
        if self.owns_master {
            self.master.dispose().await;
        }
        info!("Database isolation closed");
    }
}
