//! Process-level tenancy object.
//!
//! [`TenancyManager`] ties the configuration, the tenant registry and the
//! isolation provider together. Build one at startup, share it, and call
//! [`shutdown`](TenancyManager::shutdown) on the way out. Tests build as
//! many independent managers as they like.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{IsolationStrategy, TenancyConfig};
use crate::dialect::Dialect;
use crate::error::{ResolutionError, TenancyResult};
use crate::isolation::{
    DdlTarget, DestroyScope, IsolationProvider, IsolationProviderFactory, ProviderState,
    TenantSession,
};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::registry::TenantRegistry;
use crate::tenant::{Tenant, TenantContext, TenantId, TenantStatus};

/// Snapshot returned by [`TenancyManager::health_check`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Whether the provider is serving sessions.
    pub healthy: bool,
    /// Configured strategy.
    pub strategy: IsolationStrategy,
    /// Dialect of the shared database.
    pub dialect: Dialect,
    /// Provider lifecycle state.
    pub state: ProviderState,
    /// Engines owned by the provider.
    pub pool_count: usize,
    /// Masked shared database URL.
    pub database_url: String,
    /// When the report was taken.
    pub checked_at: DateTime<Utc>,
}

/// Tenant counts by status plus pool usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct TenancyMetrics {
    pub total_tenants: usize,
    pub active_tenants: usize,
    pub suspended_tenants: usize,
    pub provisioning_tenants: usize,
    pub deleted_tenants: usize,
    pub pool_count: usize,
}

/// Configuration, registry and provider, owned together.
pub struct TenancyManager {
    config: Arc<TenancyConfig>,
    provider: Arc<dyn IsolationProvider>,
    registry: Arc<dyn TenantRegistry>,
}

impl std::fmt::Debug for TenancyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenancyManager")
            .field("config", &self.config)
            .field("provider", &self.provider)
            .finish()
    }
}

impl TenancyManager {
    /// Builds the provider named by `config` with the bundled drivers.
    pub fn new(config: Arc<TenancyConfig>, registry: Arc<dyn TenantRegistry>) -> TenancyResult<Self> {
        let provider = IsolationProviderFactory::from_config(config.clone())?;
        Ok(Self::with_provider(config, provider, registry))
    }

    /// Wraps an existing provider.
    pub fn with_provider(
        config: Arc<TenancyConfig>,
        provider: Arc<dyn IsolationProvider>,
        registry: Arc<dyn TenantRegistry>,
    ) -> Self {
        Self {
            config,
            provider,
            registry,
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<TenancyConfig> {
        &self.config
    }

    /// The isolation provider.
    pub fn provider(&self) -> &Arc<dyn IsolationProvider> {
        &self.provider
    }

    /// The tenant registry.
    pub fn registry(&self) -> &Arc<dyn TenantRegistry> {
        &self.registry
    }

    async fn require(&self, id: &TenantId) -> TenancyResult<Tenant> {
        self.registry.get_by_id(id).await?.ok_or_else(|| {
            ResolutionError::TenantNotFound {
                identifier: id.to_string(),
            }
            .into()
        })
    }

    /// Registers a tenant and creates its namespace.
    ///
    /// The record is stored as `provisioning`, the namespace is created, and
    /// the record turns `active`. If namespace creation fails the record is
    /// removed again and the error is returned.
    pub async fn provision(
        &self,
        tenant: Tenant,
        metadata: Option<&SchemaMetadata>,
    ) -> TenancyResult<Tenant> {
        let record = self
            .registry
            .create(tenant.with_status(TenantStatus::Provisioning))
            .await?;

        if let Err(e) = self.provider.initialize_tenant(&record, metadata).await {
            error!(tenant_id = %record.id(), error = %e, "Provisioning failed");
            if let Err(cleanup) = self.registry.delete(record.id()).await {
                warn!(tenant_id = %record.id(), error = %cleanup, "Could not remove failed tenant record");
            }
            return Err(e);
        }

        let active = self
            .registry
            .set_status(record.id(), TenantStatus::Active)
            .await?;
        info!(tenant_id = %active.id(), identifier = %active.identifier(), "Provisioned tenant");
        Ok(active)
    }

    /// Destroys a tenant's data and marks the record deleted.
    pub async fn decommission(&self, id: &TenantId, scope: &DestroyScope) -> TenancyResult<Tenant> {
        let tenant = self.require(id).await?;
        self.provider.destroy_tenant(&tenant, scope).await?;
        let deleted = self.registry.set_status(id, TenantStatus::Deleted).await?;
        warn!(tenant_id = %id, "Decommissioned tenant");
        Ok(deleted)
    }

    /// Runs `fut` with the tenant active in [`TenantContext`].
    ///
    /// Fails before running `fut` if the tenant is unknown or not active.
    pub async fn tenant_scope<F>(&self, id: &TenantId, fut: F) -> TenancyResult<F::Output>
    where
        F: Future,
    {
        let tenant = self.require(id).await?;
        if !tenant.is_active() {
            return Err(ResolutionError::TenantInactive {
                identifier: tenant.identifier().to_string(),
                status: tenant.status().to_string(),
            }
            .into());
        }
        Ok(TenantContext::scope(tenant, fut).await)
    }

    /// Session for the tenant active in [`TenantContext`].
    pub async fn current_session(&self) -> TenancyResult<TenantSession> {
        let tenant = TenantContext::get()?;
        self.provider.acquire_session(&tenant).await
    }

    /// Scopes `query` to the tenant active in [`TenantContext`].
    pub async fn filter_current(&self, query: Query) -> TenancyResult<Query> {
        let tenant = TenantContext::get()?;
        self.provider.apply_filter(query, &tenant).await
    }

    /// DDL target of a registered tenant.
    pub async fn ddl_target(&self, id: &TenantId) -> TenancyResult<DdlTarget> {
        let tenant = self.require(id).await?;
        self.provider.ddl_target(&tenant)
    }

    /// Provider state and pool usage.
    pub fn health_check(&self) -> HealthReport {
        let state = self.provider.state();
        HealthReport {
            healthy: state == ProviderState::Ready,
            strategy: self.provider.strategy(),
            dialect: self.provider.dialect(),
            state,
            pool_count: self.provider.pool_count(),
            database_url: self.config.masked_database_url(),
            checked_at: Utc::now(),
        }
    }

    /// Tenant counts by status.
    pub async fn metrics(&self) -> TenancyResult<TenancyMetrics> {
        let tenants = self.registry.list(None).await?;
        let mut metrics = TenancyMetrics {
            total_tenants: tenants.len(),
            pool_count: self.provider.pool_count(),
            ..Default::default()
        };
        for tenant in &tenants {
            match tenant.status() {
                TenantStatus::Active => metrics.active_tenants += 1,
                TenantStatus::Suspended => metrics.suspended_tenants += 1,
                TenantStatus::Provisioning => metrics.provisioning_tenants += 1,
                TenantStatus::Deleted => metrics.deleted_tenants += 1,
            }
        }
        Ok(metrics)
    }

    /// Closes the provider. Later sessions fail.
    pub async fn shutdown(&self) {
        self.provider.close().await;
        info!("Tenancy manager shut down");
    }
}
