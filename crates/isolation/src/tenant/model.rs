//! The tenant value type.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{IsolationStrategy, mask_url};

use super::TenantId;

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    /// Serving traffic.
    #[default]
    Active,
    /// Temporarily blocked.
    Suspended,
    /// Soft-deleted.
    Deleted,
    /// Namespace creation in progress.
    Provisioning,
}

impl TenantStatus {
    /// Returns the lowercase status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deleted => "deleted",
            TenantStatus::Provisioning => "provisioning",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "deleted" => Ok(TenantStatus::Deleted),
            "provisioning" => Ok(TenantStatus::Provisioning),
            other => Err(format!("unknown tenant status: {other}")),
        }
    }
}

/// An immutable tenant record.
///
/// `identifier` is the slug that ends up in schema, database and table names.
/// It is not validated here: records come from an external registry and are
/// re-validated at every DDL boundary instead.
///
/// Modifications return a new value (`with_status`, `with_metadata`).
///
/// # Examples
///
/// ```
/// use tenantry_isolation::tenant::{Tenant, TenantStatus};
///
/// let tenant = Tenant::builder("t-1", "acme-corp")
///     .name("Acme Corp")
///     .metadata("plan", serde_json::json!("gold"))
///     .build();
///
/// assert!(tenant.is_active());
/// let suspended = tenant.with_status(TenantStatus::Suspended);
/// assert!(!suspended.is_active());
/// assert!(tenant.is_active());
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct Tenant {
    id: TenantId,
    identifier: String,
    name: String,
    #[serde(default)]
    status: TenantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    isolation_strategy: Option<IsolationStrategy>,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_name: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates an active tenant with the identifier doubling as its display name.
    pub fn new(id: impl Into<TenantId>, identifier: impl Into<String>) -> Self {
        Self::builder(id, identifier).build()
    }

    /// Starts building a tenant.
    pub fn builder(id: impl Into<TenantId>, identifier: impl Into<String>) -> TenantBuilder {
        TenantBuilder::new(id.into(), identifier.into())
    }

    /// Returns the globally unique id.
    pub fn id(&self) -> &TenantId {
        &self.id
    }

    /// Returns the slug used to derive namespaces.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the lifecycle status.
    pub fn status(&self) -> TenantStatus {
        self.status
    }

    /// Returns `true` if the tenant is serving traffic.
    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    /// Returns the per-tenant strategy override, if any.
    pub fn isolation_strategy(&self) -> Option<IsolationStrategy> {
        self.isolation_strategy
    }

    /// Returns the open metadata map.
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Returns the dedicated database URL override, if any.
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    /// Returns the schema name override, if any.
    ///
    /// Overrides are caller-controlled and validated again before DDL use.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema_name.as_deref()
    }

    /// Returns the creation timestamp.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last-modified timestamp.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns a copy with a different status and a fresh `updated_at`.
    pub fn with_status(&self, status: TenantStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        next
    }

    /// Returns a copy with `entries` merged into the metadata map.
    pub fn with_metadata<I>(&self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, serde_json::Value)>,
    {
        let mut next = self.clone();
        next.metadata.extend(entries);
        next.updated_at = Utc::now();
        next
    }
}

impl PartialEq for Tenant {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tenant {}

impl std::hash::Hash for Tenant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("isolation_strategy", &self.isolation_strategy)
            .field("metadata", &self.metadata)
            .field("database_url", &self.database_url.as_deref().map(mask_url))
            .field("schema_name", &self.schema_name)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Tenant`].
#[derive(Debug)]
pub struct TenantBuilder {
    tenant: Tenant,
}

impl TenantBuilder {
    fn new(id: TenantId, identifier: String) -> Self {
        let now = Utc::now();
        Self {
            tenant: Tenant {
                id,
                name: identifier.clone(),
                identifier,
                status: TenantStatus::Active,
                isolation_strategy: None,
                metadata: BTreeMap::new(),
                database_url: None,
                schema_name: None,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Sets the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.tenant.name = name.into();
        self
    }

    /// Sets the lifecycle status.
    pub fn status(mut self, status: TenantStatus) -> Self {
        self.tenant.status = status;
        self
    }

    /// Overrides the configured isolation strategy for this tenant.
    pub fn isolation_strategy(mut self, strategy: IsolationStrategy) -> Self {
        self.tenant.isolation_strategy = Some(strategy);
        self
    }

    /// Adds one metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.tenant.metadata.insert(key.into(), value);
        self
    }

    /// Points the tenant at a dedicated database.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.tenant.database_url = Some(url.into());
        self
    }

    /// Overrides the derived schema name.
    pub fn schema_name(mut self, schema: impl Into<String>) -> Self {
        self.tenant.schema_name = Some(schema.into());
        self
    }

    /// Sets the creation timestamp.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.tenant.created_at = at;
        self.tenant.updated_at = at;
        self
    }

    /// Finishes the tenant.
    pub fn build(self) -> Tenant {
        self.tenant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let tenant = Tenant::new("t1", "acme-corp");
        assert_eq!(tenant.id().as_str(), "t1");
        assert_eq!(tenant.identifier(), "acme-corp");
        assert_eq!(tenant.name(), "acme-corp");
        assert_eq!(tenant.status(), TenantStatus::Active);
        assert!(tenant.isolation_strategy().is_none());
        assert!(tenant.metadata().is_empty());
        assert_eq!(tenant.created_at(), tenant.updated_at());
    }

    #[test]
    fn test_with_status_leaves_original_untouched() {
        let tenant = Tenant::new("t1", "acme-corp");
        let deleted = tenant.with_status(TenantStatus::Deleted);
        assert_eq!(tenant.status(), TenantStatus::Active);
        assert_eq!(deleted.status(), TenantStatus::Deleted);
        assert_eq!(tenant, deleted);
    }

    #[test]
    fn test_debug_masks_database_password() {
        let tenant = Tenant::builder("t1", "acme-corp")
            .database_url("postgresql://admin:hunter2@db/acme")
            .build();
        let rendered = format!("{tenant:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("admin:***@db/acme"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("Suspended".parse::<TenantStatus>().unwrap(), TenantStatus::Suspended);
        assert!("gone".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn test_serde_roundtrip_preserves_overrides() {
        let tenant = Tenant::builder("t9", "globex")
            .isolation_strategy(IsolationStrategy::Schema)
            .schema_name("custom_globex")
            .build();
        let json = serde_json::to_value(&tenant).unwrap();
        assert_eq!(json["isolation_strategy"], "schema");
        let back: Tenant = serde_json::from_value(json).unwrap();
        assert_eq!(back.schema_name(), Some("custom_globex"));
        assert_eq!(back.isolation_strategy(), Some(IsolationStrategy::Schema));
    }
}
