//! Tenant-bound sessions.

use std::collections::BTreeMap;
use std::fmt;

use crate::config::IsolationStrategy;
use crate::dialect::Dialect;
use crate::engine::{Connection, Row, SqlValue};
use crate::error::{EngineError, IdentifierError, IsolationError, TenancyResult};
use crate::query::{Query, Statement};
use crate::tenant::TenantId;
use crate::validation::{assert_safe_table_name, quote_identifier};

/// The namespace a session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNamespace {
    /// A native schema. `activated` is `true` when the connection's search
    /// path points at it, so unqualified names resolve there too.
    Schema {
        /// Validated schema name.
        name: String,
        /// Whether the schema is the session's active target.
        activated: bool,
    },
    /// Prefixed tables in a shared schema.
    TablePrefix(String),
    /// A dedicated database.
    Database {
        /// Validated database name (or file stem on SQLite).
        name: String,
    },
    /// Shared tables, rows tagged by `tenant_column`.
    Shared {
        /// Column holding the tenant id.
        tenant_column: String,
        /// Whether structured queries must carry the tenant filter.
        enforce_filter: bool,
    },
}

/// A checked-out connection bound to one tenant.
///
/// Raw SQL ([`execute`](Self::execute), [`query`](Self::query)) runs as-is.
/// Structured queries ([`fetch`](Self::fetch), [`run`](Self::run),
/// [`count`](Self::count)) resolve their table through
/// [`table_name`](Self::table_name), so the same [`Query`] lands in the
/// right namespace under every strategy.
///
/// A failing statement inside an open transaction rolls the transaction back
/// before the error is returned. Dropping a session with an open transaction
/// rolls it back as well.
pub struct TenantSession {
    conn: Box<dyn Connection>,
    tenant_id: TenantId,
    strategy: IsolationStrategy,
    namespace: SessionNamespace,
}

impl fmt::Debug for TenantSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantSession")
            .field("tenant_id", &self.tenant_id)
            .field("strategy", &self.strategy)
            .field("namespace", &self.namespace)
            .field("dialect", &self.conn.dialect())
            .finish()
    }
}

impl TenantSession {
    pub(crate) fn new(
        conn: Box<dyn Connection>,
        tenant_id: TenantId,
        strategy: IsolationStrategy,
        namespace: SessionNamespace,
    ) -> Self {
        Self {
            conn,
            tenant_id,
            strategy,
            namespace,
        }
    }

    pub(crate) fn relabel(mut self, strategy: IsolationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Tenant this session is bound to.
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Strategy that produced the session.
    pub fn strategy(&self) -> IsolationStrategy {
        self.strategy
    }

    /// Namespace the session is bound to.
    pub fn namespace(&self) -> &SessionNamespace {
        &self.namespace
    }

    /// Dialect of the underlying connection.
    pub fn dialect(&self) -> Dialect {
        self.conn.dialect()
    }

    /// Schema name, for schema-bound sessions.
    pub fn schema(&self) -> Option<&str> {
        match &self.namespace {
            SessionNamespace::Schema { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Table prefix, for prefix-bound sessions.
    pub fn table_prefix(&self) -> Option<&str> {
        match &self.namespace {
            SessionNamespace::TablePrefix(prefix) => Some(prefix),
            _ => None,
        }
    }

    /// Session info as string pairs (`tenant_id`, `strategy`, plus
    /// `schema`, `table_prefix`, `database` or `tenant_column`).
    pub fn info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        info.insert("tenant_id".to_string(), self.tenant_id.to_string());
        info.insert("strategy".to_string(), self.strategy.to_string());
        match &self.namespace {
            SessionNamespace::Schema { name, .. } => {
                info.insert("schema".to_string(), name.clone());
            }
            SessionNamespace::TablePrefix(prefix) => {
                info.insert("table_prefix".to_string(), prefix.clone());
            }
            SessionNamespace::Database { name } => {
                info.insert("database".to_string(), name.clone());
            }
            SessionNamespace::Shared { tenant_column, .. } => {
                info.insert("tenant_column".to_string(), tenant_column.clone());
            }
        }
        info
    }

    /// Resolves a logical table name to a quoted reference in this
    /// session's namespace.
    pub fn table_name(&self, table: &str) -> Result<String, IdentifierError> {
        let dialect = self.dialect();
        match &self.namespace {
            SessionNamespace::Schema { name, .. } => {
                assert_safe_table_name(table, "resolve schema table")?;
                Ok(format!(
                    "{}.{}",
                    quote_identifier(dialect, name),
                    quote_identifier(dialect, table)
                ))
            }
            SessionNamespace::TablePrefix(prefix) => {
                let full = format!("{prefix}{table}");
                assert_safe_table_name(&full, "resolve prefixed table")?;
                Ok(quote_identifier(dialect, &full))
            }
            SessionNamespace::Database { .. } | SessionNamespace::Shared { .. } => {
                assert_safe_table_name(table, "resolve table")?;
                Ok(quote_identifier(dialect, table))
            }
        }
    }

    /// Executes raw SQL, returning the number of affected rows.
    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<u64> {
        let result = self.conn.execute(sql, params).await;
        self.settle("execute", result).await
    }

    /// Runs a raw query.
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> TenancyResult<Vec<Row>> {
        let result = self.conn.query(sql, params).await;
        self.settle("query", result).await
    }

    /// Executes one or more raw statements without parameters.
    pub async fn batch_execute(&mut self, sql: &str) -> TenancyResult<()> {
        let result = self.conn.batch_execute(sql).await;
        self.settle("batch_execute", result).await
    }

    /// Executes a rendered statement.
    pub async fn execute_statement(&mut self, statement: &Statement) -> TenancyResult<u64> {
        self.execute(&statement.sql, &statement.params).await
    }

    /// Runs a rendered query.
    pub async fn query_statement(&mut self, statement: &Statement) -> TenancyResult<Vec<Row>> {
        self.query(&statement.sql, &statement.params).await
    }

    /// Runs a structured read in this session's namespace.
    pub async fn fetch(&mut self, query: &Query) -> TenancyResult<Vec<Row>> {
        let statement = self.render("fetch", query)?;
        let result = self.conn.query(&statement.sql, &statement.params).await;
        self.settle("fetch", result).await
    }

    /// Runs a structured write in this session's namespace.
    pub async fn run(&mut self, query: &Query) -> TenancyResult<u64> {
        let statement = self.render("run", query)?;
        let result = self.conn.execute(&statement.sql, &statement.params).await;
        self.settle("run", result).await
    }

    /// Runs a [`Query::count`] and returns the count.
    pub async fn count(&mut self, query: &Query) -> TenancyResult<i64> {
        let rows = self.fetch(query).await?;
        Ok(rows
            .first()
            .and_then(|row| row.get_index(0))
            .and_then(SqlValue::as_i64)
            .unwrap_or(0))
    }

    /// Opens a transaction.
    pub async fn begin(&mut self) -> TenancyResult<()> {
        let result = self.conn.begin().await;
        self.settle("begin", result).await
    }

    /// Commits the open transaction.
    pub async fn commit(&mut self) -> TenancyResult<()> {
        let result = self.conn.commit().await;
        self.settle("commit", result).await
    }

    /// Rolls the open transaction back.
    pub async fn rollback(&mut self) -> TenancyResult<()> {
        self.conn
            .rollback()
            .await
            .map_err(|e| IsolationError::failed("rollback", &self.tenant_id, e).into())
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.conn.in_transaction()
    }

    /// Releases the session, rolling back any open transaction first.
    pub async fn close(mut self) -> TenancyResult<()> {
        if self.conn.in_transaction() {
            self.rollback().await?;
        }
        Ok(())
    }

    fn render(&self, operation: &str, query: &Query) -> TenancyResult<Statement> {
        if let SessionNamespace::Shared {
            tenant_column,
            enforce_filter: true,
        } = &self.namespace
        {
            if !query.is_tenant_filtered(tenant_column, &self.tenant_id) {
                return Err(IsolationError::message(
                    operation,
                    &self.tenant_id,
                    format!(
                        "query on {:?} is not scoped to this tenant; pass it through apply_filter",
                        query.table()
                    ),
                )
                .into());
            }
        }
        let table = self.table_name(query.table())?;
        Ok(query.render(self.dialect(), &table)?)
    }

    async fn settle<T>(&mut self, operation: &str, result: Result<T, EngineError>) -> TenancyResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if self.conn.in_transaction() {
                    if let Err(rollback) = self.conn.rollback().await {
                        tracing::error!(
                            tenant_id = %self.tenant_id,
                            operation,
                            error = %rollback,
                            "Rollback after failed statement also failed"
                        );
                    }
                }
                tracing::error!(tenant_id = %self.tenant_id, operation, error = %e, "Session statement failed");
                Err(IsolationError::failed(operation, &self.tenant_id, e).into())
            }
        }
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::engine::Engine;
    use crate::engine::sqlite::SqliteEngine;

    async fn session(namespace: SessionNamespace) -> TenantSession {
        let engine = SqliteEngine::open("sqlite://:memory:", &PoolSettings::default()).unwrap();
        let conn = engine.connect().await.unwrap();
        TenantSession::new(conn, TenantId::new("t1"), IsolationStrategy::Rls, namespace)
    }

    fn shared(enforce_filter: bool) -> SessionNamespace {
        SessionNamespace::Shared {
            tenant_column: "tenant_id".to_string(),
            enforce_filter,
        }
    }

    #[tokio::test]
    async fn test_table_name_per_namespace() {
        let s = session(SessionNamespace::TablePrefix("t_acme_".to_string())).await;
        assert_eq!(s.table_name("orders").unwrap(), "\"t_acme_orders\"");
        assert!(s.table_name("orders; drop").is_err());
        assert_eq!(s.info().get("table_prefix").map(String::as_str), Some("t_acme_"));

        let s = session(SessionNamespace::Schema {
            name: "tenant_acme".to_string(),
            activated: false,
        })
        .await;
        assert_eq!(s.table_name("orders").unwrap(), "\"tenant_acme\".\"orders\"");
        assert_eq!(s.schema(), Some("tenant_acme"));
    }

    #[tokio::test]
    async fn test_enforced_session_rejects_unfiltered_queries() {
        let mut s = session(shared(true)).await;
        s.batch_execute("CREATE TABLE orders (id INTEGER, tenant_id TEXT)")
            .await
            .unwrap();

        let err = s.fetch(&Query::select("orders")).await.unwrap_err();
        assert!(err.is_isolation_failure());

        let other = Query::select("orders").with_tenant_filter("tenant_id", &TenantId::new("t2"));
        assert!(s.fetch(&other).await.is_err());

        let insert = Query::insert("orders")
            .value("id", 1)
            .with_tenant_filter("tenant_id", &TenantId::new("t1"));
        assert_eq!(s.run(&insert).await.unwrap(), 1);

        let count = Query::count("orders").with_tenant_filter("tenant_id", &TenantId::new("t1"));
        assert_eq!(s.count(&count).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back_transaction() {
        let mut s = session(shared(false)).await;
        s.batch_execute("CREATE TABLE orders (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        s.begin().await.unwrap();
        s.execute("INSERT INTO orders (id) VALUES (1)", &[]).await.unwrap();

        let err = s
            .execute("INSERT INTO orders (id) VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("execute"));
        assert!(!s.in_transaction());

        let rows = s.query("SELECT COUNT(*) AS n FROM orders", &[]).await.unwrap();
        assert_eq!(rows[0].get("n").and_then(SqlValue::as_i64), Some(0));
    }
}
