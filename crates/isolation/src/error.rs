//! Error types for the isolation layer.
//!
//! Errors are organized in a hierarchy that mirrors the failure taxonomy of a
//! multi-tenant data path: identifier rejections (raised before any DDL is sent),
//! configuration errors (fatal at startup), isolation failures (backing-store
//! operations that failed and were rolled back), tenant-context misuse, and
//! errors surfaced by external collaborators such as the tenant registry.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use thiserror::Error;

use crate::tenant::TenantId;

/// The primary error type for all isolation operations.
#[derive(Error, Debug)]
pub enum TenancyError {
    /// A tenant-derived identifier was rejected before reaching DDL.
    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    /// The tenancy configuration is invalid.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A backing-store operation failed.
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// The per-unit-of-work tenant context was misused.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Tenant resolution or registry lookup failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl TenancyError {
    /// Returns `true` if this error was raised by identifier validation.
    pub fn is_invalid_identifier(&self) -> bool {
        matches!(self, TenancyError::Identifier(_))
    }

    /// Returns `true` if this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, TenancyError::Configuration(_))
    }

    /// Returns `true` if this error is an isolation failure.
    pub fn is_isolation_failure(&self) -> bool {
        matches!(self, TenancyError::Isolation(_))
    }
}

/// Rejection of an untrusted identifier.
///
/// These are always raised before any statement is sent to the database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("invalid tenant identifier {value:?}{}", context_suffix(.context))]
    InvalidTenantIdentifier { value: String, context: String },

    #[error("invalid tenant id {value:?}{}", context_suffix(.context))]
    InvalidTenantId { value: String, context: String },

    #[error("unsafe schema name {value:?}{}", context_suffix(.context))]
    InvalidSchemaName { value: String, context: String },

    #[error("unsafe database name {value:?}{}", context_suffix(.context))]
    InvalidDatabaseName { value: String, context: String },

    #[error("unsafe table name {value:?}{}", context_suffix(.context))]
    InvalidTableName { value: String, context: String },

    #[error("unsafe column name {value:?}{}", context_suffix(.context))]
    InvalidColumnName { value: String, context: String },
}

impl IdentifierError {
    /// Returns the rejected value.
    pub fn value(&self) -> &str {
        match self {
            IdentifierError::InvalidTenantIdentifier { value, .. }
            | IdentifierError::InvalidTenantId { value, .. }
            | IdentifierError::InvalidSchemaName { value, .. }
            | IdentifierError::InvalidDatabaseName { value, .. }
            | IdentifierError::InvalidTableName { value, .. }
            | IdentifierError::InvalidColumnName { value, .. } => value,
        }
    }
}

fn context_suffix(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(" ({context})")
    }
}

/// Invalid tenancy configuration. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("unsupported isolation strategy: {strategy}")]
    UnsupportedStrategy { strategy: String },

    #[error(
        "hybrid premium and standard strategies must differ (both are {strategy})"
    )]
    HybridStrategiesIdentical { strategy: String },

    #[error("hybrid sub-strategy cannot itself be hybrid")]
    NestedHybrid,

    #[error("database isolation on {dialect} requires database_url_template")]
    MissingDatabaseUrlTemplate { dialect: String },

    #[error("database_url_template must contain {{tenant_id}} or {{database_name}}")]
    InvalidDatabaseUrlTemplate,

    #[error("invalid schema prefix {prefix:?}: must match ^[a-z][a-z0-9_]*$")]
    InvalidSchemaPrefix { prefix: String },

    #[error("invalid database url: {message}")]
    InvalidDatabaseUrl { message: String },

    #[error("invalid pool settings: {message}")]
    InvalidPoolSettings { message: String },

    #[error("invalid {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// A backing-store operation failed while isolating a tenant.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("{operation} failed for tenant {tenant_id}: {message}")]
    Failed {
        operation: String,
        tenant_id: TenantId,
        message: String,
        #[source]
        source: Option<EngineError>,
    },

    #[error("isolation provider is closed")]
    ProviderClosed,

    #[error(
        "{operation} for tenant {tenant_id} requires manual setup on {dialect}: {message}"
    )]
    ManualSetupRequired {
        operation: String,
        tenant_id: TenantId,
        dialect: String,
        message: String,
    },

    #[error(
        "destroy_tenant for tenant {tenant_id} requires an explicit table list or schema metadata"
    )]
    DestroyScopeRequired { tenant_id: TenantId },

    #[error("{operation} is not supported by {strategy}")]
    Unsupported { operation: String, strategy: String },

    #[error("{operation} failed: {message}")]
    Setup {
        operation: String,
        message: String,
        #[source]
        source: Option<EngineError>,
    },
}

impl IsolationError {
    /// Wraps an engine error with the operation name and tenant.
    pub fn failed(operation: &str, tenant_id: &TenantId, source: EngineError) -> Self {
        IsolationError::Failed {
            operation: operation.to_string(),
            tenant_id: tenant_id.clone(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Builds a failure that has no underlying engine error.
    pub fn message(operation: &str, tenant_id: &TenantId, message: impl Into<String>) -> Self {
        IsolationError::Failed {
            operation: operation.to_string(),
            tenant_id: tenant_id.clone(),
            message: message.into(),
            source: None,
        }
    }

    /// Wraps an engine error raised by a tenant-independent setup step.
    pub fn setup(operation: &str, source: EngineError) -> Self {
        IsolationError::Setup {
            operation: operation.to_string(),
            message: source.to_string(),
            source: Some(source),
        }
    }
}

/// Misuse of the task-local tenant context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("no tenant is set for the current unit of work")]
    TenantNotSet,

    #[error("no tenant scope is active for the current unit of work")]
    NoActiveScope,

    #[error("context token does not belong to the current unit of work")]
    ForeignToken,
}

/// Errors surfaced by tenant resolution and the tenant registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("tenant resolution failed: {message}")]
    ResolutionFailed { message: String },

    #[error("tenant not found: {identifier}")]
    TenantNotFound { identifier: String },

    #[error("tenant {identifier} is not active (status: {status})")]
    TenantInactive { identifier: String, status: String },

    #[error("tenant already exists: {identifier}")]
    AlreadyExists { identifier: String },
}

/// Driver-level failure raised by an [`Engine`](crate::engine::Engine).
///
/// Providers never surface this directly; it is wrapped into
/// [`IsolationError::Failed`] together with the operation and tenant.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("connection to {dialect} failed: {message}")]
    ConnectionFailed { dialect: String, message: String },

    #[error("statement failed on {dialect}: {message}")]
    Statement { dialect: String, message: String },

    #[error("engine for {url} has been disposed")]
    Disposed { url: String },

    #[error("no driver available for {dialect} (url: {url})")]
    UnsupportedDialect { dialect: String, url: String },

    #[error("internal engine error: {message}")]
    Internal { message: String },
}

/// Result type for isolation operations.
pub type TenancyResult<T> = Result<T, TenancyError>;
