//! Isolation providers.
//!
//! An [`IsolationProvider`] turns "run this for tenant T" into concrete
//! database behaviour. Four strategies ship with the crate:
//!
//! | Strategy | Provider | Namespace per tenant |
//! |----------|----------|----------------------|
//! | `schema` | [`SchemaIsolation`] | schema, or table prefix without native schemas |
//! | `database` | [`DatabaseIsolation`] | database (one file on SQLite) |
//! | `rls` | [`RowLevelSecurityIsolation`] | none, rows tagged with the tenant id |
//! | `hybrid` | [`HybridIsolation`] | premium tier and standard tier differ |
//!
//! Providers are built once by [`IsolationProviderFactory`] and shared as
//! `Arc<dyn IsolationProvider>`. Every provider moves through
//! [`ProviderState::Uninitialized`] → [`ProviderState::Ready`] →
//! [`ProviderState::Closed`]; once closed, every operation fails with
//! [`IsolationError::ProviderClosed`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{IsolationStrategy, mask_url};
use crate::dialect::Dialect;
use crate::error::{IsolationError, TenancyResult};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::tenant::Tenant;

mod database;
mod factory;
mod hybrid;
mod rls;
mod schema;
mod session;

pub use database::DatabaseIsolation;
pub use factory::IsolationProviderFactory;
pub use hybrid::{HybridIsolation, Tier};
pub use rls::RowLevelSecurityIsolation;
pub use schema::SchemaIsolation;
pub use session::{SessionNamespace, TenantSession};

/// Lifecycle state of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    /// Constructed but not yet usable.
    Uninitialized,
    /// Serving sessions.
    Ready,
    /// Closed; every operation fails.
    Closed,
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderState::Uninitialized => write!(f, "uninitialized"),
            ProviderState::Ready => write!(f, "ready"),
            ProviderState::Closed => write!(f, "closed"),
        }
    }
}

const UNINITIALIZED: u8 = 0;
const READY: u8 = 1;
const CLOSED: u8 = 2;

/// Lock-free lifecycle cell shared by the providers.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(UNINITIALIZED))
    }

    pub(crate) fn mark_ready(&self) {
        let _ = self
            .0
            .compare_exchange(UNINITIALIZED, READY, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// Returns `true` for the call that actually closed the provider.
    pub(crate) fn mark_closed(&self) -> bool {
        self.0.swap(CLOSED, Ordering::SeqCst) != CLOSED
    }

    pub(crate) fn state(&self) -> ProviderState {
        match self.0.load(Ordering::SeqCst) {
            UNINITIALIZED => ProviderState::Uninitialized,
            READY => ProviderState::Ready,
            _ => ProviderState::Closed,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), IsolationError> {
        match self.state() {
            ProviderState::Closed => Err(IsolationError::ProviderClosed),
            _ => Ok(()),
        }
    }
}

/// Which objects `destroy_tenant` may touch.
///
/// Shared-namespace strategies refuse to guess: an empty scope makes them
/// fail with [`IsolationError::DestroyScopeRequired`].
#[derive(Debug, Clone, Default)]
pub struct DestroyScope {
    tables: Vec<String>,
    metadata: Option<SchemaMetadata>,
}

impl DestroyScope {
    /// A scope naming nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// A scope naming logical tables.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            metadata: None,
        }
    }

    /// A scope covering every table in `metadata`.
    pub fn metadata(metadata: SchemaMetadata) -> Self {
        Self {
            tables: Vec::new(),
            metadata: Some(metadata),
        }
    }

    /// Adds tables to the scope.
    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Returns `true` if the scope names no table and carries no metadata.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.metadata.as_ref().is_none_or(SchemaMetadata::is_empty)
    }

    /// Explicitly listed tables.
    pub fn table_list(&self) -> &[String] {
        &self.tables
    }

    /// Metadata, if supplied.
    pub fn schema_metadata(&self) -> Option<&SchemaMetadata> {
        self.metadata.as_ref()
    }

    /// Explicit tables followed by every metadata table, without duplicates.
    pub fn all_tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let from_metadata = self
            .metadata
            .iter()
            .flat_map(|m| m.table_names())
            .map(str::to_string);
        for table in self.tables.iter().cloned().chain(from_metadata) {
            if !out.contains(&table) {
                out.push(table);
            }
        }
        out
    }
}

/// Where migration tooling must apply DDL for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DdlTarget {
    /// A named schema in the shared database.
    Schema {
        /// Validated schema name.
        name: String,
    },
    /// A dedicated database.
    Database {
        /// Connection URL. May contain credentials.
        url: String,
    },
    /// Prefixed tables in the shared database.
    TablePrefix {
        /// Validated table-name prefix.
        prefix: String,
    },
    /// The shared tables; migrate once for all tenants.
    Shared,
}

impl DdlTarget {
    /// Copy with any connection URL masked, for logs and reports.
    pub fn masked(&self) -> DdlTarget {
        match self {
            DdlTarget::Database { url } => DdlTarget::Database { url: mask_url(url) },
            other => other.clone(),
        }
    }
}

impl fmt::Display for DdlTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DdlTarget::Schema { name } => write!(f, "schema {name}"),
            DdlTarget::Database { url } => write!(f, "database {}", mask_url(url)),
            DdlTarget::TablePrefix { prefix } => write!(f, "table prefix {prefix}"),
            DdlTarget::Shared => write!(f, "shared (migrate once)"),
        }
    }
}

/// Strategy-specific tenant isolation.
#[async_trait]
pub trait IsolationProvider: Send + Sync + fmt::Debug {
    /// The strategy this provider implements.
    fn strategy(&self) -> IsolationStrategy;

    /// Current lifecycle state.
    fn state(&self) -> ProviderState;

    /// Dialect of the shared (or master) database.
    fn dialect(&self) -> Dialect;

    /// Checks out a connection bound to `tenant`'s namespace.
    ///
    /// Fails with [`IsolationError::ProviderClosed`] once closed, and with
    /// [`IsolationError::Failed`] if the backing store refuses.
    async fn acquire_session(&self, tenant: &Tenant) -> TenancyResult<TenantSession>;

    /// Scopes a query to `tenant`.
    ///
    /// Only row-level strategies change the query; the tenant id is always
    /// a bound parameter.
    async fn apply_filter(&self, query: Query, tenant: &Tenant) -> TenancyResult<Query>;

    /// Creates the tenant's namespace and, with metadata, its tables.
    ///
    /// Idempotent: a namespace that already exists is not an error.
    async fn initialize_tenant(
        &self,
        tenant: &Tenant,
        metadata: Option<&SchemaMetadata>,
    ) -> TenancyResult<()>;

    /// Irreversibly deletes the tenant's data.
    async fn destroy_tenant(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()>;

    /// Whether the tenant's namespace exists and a session can be bound to it.
    async fn verify_isolation(&self, tenant: &Tenant) -> TenancyResult<bool>;

    /// Where DDL for this tenant must be applied.
    fn ddl_target(&self, tenant: &Tenant) -> TenancyResult<DdlTarget>;

    /// Number of engines (connection pools) this provider owns.
    fn pool_count(&self) -> usize;

    /// Releases every owned engine. Idempotent.
    async fn close(&self);
}
