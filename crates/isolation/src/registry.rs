//! Tenant registry seam.
//!
//! The registry is the system of record for tenant rows. Production
//! deployments back it with their own store; [`InMemoryTenantRegistry`]
//! serves tests, the admin CLI and single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ResolutionError, TenancyResult};
use crate::tenant::{Tenant, TenantId, TenantStatus};
use crate::validation::assert_safe_tenant_identifier;

/// CRUD access to tenant records.
#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Looks a tenant up by id.
    async fn get_by_id(&self, id: &TenantId) -> TenancyResult<Option<Tenant>>;

    /// Looks a tenant up by identifier slug.
    async fn get_by_identifier(&self, identifier: &str) -> TenancyResult<Option<Tenant>>;

    /// Lists tenants, optionally filtered by status, ordered by creation time.
    async fn list(&self, status: Option<TenantStatus>) -> TenancyResult<Vec<Tenant>>;

    /// Counts tenants, optionally filtered by status.
    async fn count(&self, status: Option<TenantStatus>) -> TenancyResult<usize>;

    /// Stores a new tenant.
    ///
    /// Fails if the identifier is malformed or the id or identifier is taken.
    async fn create(&self, tenant: Tenant) -> TenancyResult<Tenant>;

    /// Replaces an existing tenant record.
    async fn update(&self, tenant: Tenant) -> TenancyResult<Tenant>;

    /// Changes a tenant's status.
    async fn set_status(&self, id: &TenantId, status: TenantStatus) -> TenancyResult<Tenant>;

    /// Removes a tenant record.
    async fn delete(&self, id: &TenantId) -> TenancyResult<()>;
}

/// Registry kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryTenantRegistry {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(id: &TenantId) -> ResolutionError {
    ResolutionError::TenantNotFound {
        identifier: id.to_string(),
    }
}

#[async_trait]
impl TenantRegistry for InMemoryTenantRegistry {
    async fn get_by_id(&self, id: &TenantId) -> TenancyResult<Option<Tenant>> {
        Ok(self.tenants.read().get(id).cloned())
    }

    async fn get_by_identifier(&self, identifier: &str) -> TenancyResult<Option<Tenant>> {
        Ok(self
            .tenants
            .read()
            .values()
            .find(|t| t.identifier() == identifier)
            .cloned())
    }

    async fn list(&self, status: Option<TenantStatus>) -> TenancyResult<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self
            .tenants
            .read()
            .values()
            .filter(|t| status.is_none_or(|s| t.status() == s))
            .cloned()
            .collect();
        tenants.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(tenants)
    }

    async fn count(&self, status: Option<TenantStatus>) -> TenancyResult<usize> {
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| status.is_none_or(|s| t.status() == s))
            .count())
    }

    async fn create(&self, tenant: Tenant) -> TenancyResult<Tenant> {
        tenant.id().validate()?;
        assert_safe_tenant_identifier(tenant.identifier(), "register tenant")?;

        let mut tenants = self.tenants.write();
        let taken = tenants.contains_key(tenant.id())
            || tenants.values().any(|t| t.identifier() == tenant.identifier());
        if taken {
            return Err(ResolutionError::AlreadyExists {
                identifier: tenant.identifier().to_string(),
            }
            .into());
        }
        tenants.insert(tenant.id().clone(), tenant.clone());
        Ok(tenant)
    }

    async fn update(&self, tenant: Tenant) -> TenancyResult<Tenant> {
        let mut tenants = self.tenants.write();
        let clash = tenants
            .values()
            .any(|t| t.identifier() == tenant.identifier() && t.id() != tenant.id());
        if clash {
            return Err(ResolutionError::AlreadyExists {
                identifier: tenant.identifier().to_string(),
            }
            .into());
        }
        match tenants.get_mut(tenant.id()) {
            Some(slot) => {
                *slot = tenant.clone();
                Ok(tenant)
            }
            None => Err(not_found(tenant.id()).into()),
        }
    }

    async fn set_status(&self, id: &TenantId, status: TenantStatus) -> TenancyResult<Tenant> {
        let mut tenants = self.tenants.write();
        let slot = tenants.get_mut(id).ok_or_else(|| not_found(id))?;
        *slot = slot.with_status(status);
        tracing::debug!(tenant_id = %id, status = %status, "Tenant status changed");
        Ok(slot.clone())
    }

    async fn delete(&self, id: &TenantId) -> TenancyResult<()> {
        self.tenants
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(id).into())
    }
}
