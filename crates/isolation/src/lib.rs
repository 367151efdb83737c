//! Tenantry isolation core
//!
//! This crate keeps the data of many tenants apart inside one running
//! service. It resolves which tenant a unit of work belongs to, carries that
//! tenant through arbitrarily deep async call chains, and binds database
//! sessions to the tenant's namespace.
//!
//! # Features
//!
//! - **Four isolation strategies**: schema-per-tenant, database-per-tenant,
//!   row-level security on shared tables, and a premium/standard hybrid
//! - **Task-local tenant context** that never leaks between concurrent tasks
//! - **Identifier validation** at every DDL boundary
//! - **Dialect awareness**: PostgreSQL, SQLite, MySQL, SQL Server
//!
//! # Backend Features
//!
//! - `sqlite` (default) - SQLite engine on r2d2, file and in-memory
//! - `postgres` - PostgreSQL engine on deadpool-postgres
//!
//! MySQL and SQL Server are classified and rendered but ship no driver;
//! plug one in through [`engine::Connector`].
//!
//! # Architecture
//!
//! - [`validation`] - identifier checks and sanitizing
//! - [`dialect`] - engine classification and capability matrix
//! - [`config`] - process-wide [`TenancyConfig`]
//! - [`tenant`] - tenant model, [`TenantContext`] and request resolution
//! - [`registry`] - tenant registry seam
//! - [`engine`] - connection pools and drivers
//! - [`metadata`] - table metadata that DDL is rendered from
//! - [`query`] - structured queries that providers can scope
//! - [`isolation`] - the providers and their factory
//! - [`manager`] - process-level [`TenancyManager`]
//! - [`error`] - error types
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tenantry_isolation::metadata::{ColumnDef, ColumnType, SchemaMetadata, TableDef};
//! use tenantry_isolation::{IsolationProviderFactory, IsolationStrategy, Query, TenancyConfig, Tenant};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), tenantry_isolation::TenancyError> {
//! let config = Arc::new(TenancyConfig::new("sqlite://:memory:"));
//! let provider = IsolationProviderFactory::create(IsolationStrategy::Schema, config)?;
//!
//! let metadata = SchemaMetadata::new().table(
//!     TableDef::new("orders")
//!         .column(ColumnDef::new("id", ColumnType::Integer).primary_key())
//!         .column(ColumnDef::new("total", ColumnType::Real)),
//! );
//! let acme = Tenant::new("t-1", "acme-corp");
//! provider.initialize_tenant(&acme, Some(&metadata)).await?;
//!
//! let mut session = provider.acquire_session(&acme).await?;
//! session
//!     .run(&Query::insert("orders").value("id", 1).value("total", 9.5))
//!     .await?;
//! assert_eq!(session.count(&Query::count("orders")).await?, 1);
//! # Ok(())
//! # }
//! ```
//!
//! # Tenant context
//!
//! ```
//! use tenantry_isolation::{Tenant, TenantContext};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let acme = Tenant::new("t-1", "acme-corp");
//! TenantContext::scope(acme, async {
//!     assert_eq!(TenantContext::get().unwrap().identifier(), "acme-corp");
//! })
//! .await;
//! assert!(TenantContext::get_optional().is_none());
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod isolation;
pub mod manager;
pub mod metadata;
pub mod query;
pub mod registry;
pub mod tenant;
pub mod validation;

// Re-export commonly used types at crate root
pub use config::{IsolationStrategy, PoolSettings, TenancyConfig};
pub use dialect::{Dialect, DialectCapabilities};
pub use error::{TenancyError, TenancyResult};
pub use query::{Query, Statement};
pub use tenant::{Tenant, TenantContext, TenantId, TenantStatus};

// Re-export providers
pub use isolation::{
    DatabaseIsolation, DdlTarget, DestroyScope, HybridIsolation, IsolationProvider,
    IsolationProviderFactory, ProviderState, RowLevelSecurityIsolation, SchemaIsolation,
    TenantSession,
};
pub use manager::{HealthReport, TenancyManager, TenancyMetrics};
pub use registry::{InMemoryTenantRegistry, TenantRegistry};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
