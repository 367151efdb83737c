//! Tiered isolation.
//!
//! Tenants in the configured premium set go to one strategy, everyone else
//! to another. Both tiers run against the same database, so the provider
//! builds a single engine and hands it to both sub-providers. The
//! sub-providers never own that engine, and [`HybridIsolation`] never
//! forwards `close()` to them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{IsolationStrategy, TenancyConfig};
use crate::dialect::Dialect;
use crate::engine::{Connector, Engine};
use crate::error::{ConfigurationError, IsolationError, TenancyResult};
use crate::metadata::SchemaMetadata;
use crate::query::Query;
use crate::tenant::Tenant;

use super::database::DatabaseIsolation;
use super::rls::RowLevelSecurityIsolation;
use super::schema::SchemaIsolation;
use super::session::TenantSession;
use super::{DdlTarget, DestroyScope, IsolationProvider, Lifecycle, ProviderState};

/// Service tier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Member of the premium set.
    Premium,
    /// Everyone else.
    Standard,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Premium => write!(f, "premium"),
            Tier::Standard => write!(f, "standard"),
        }
    }
}

#[derive(Debug)]
enum TierProvider {
    Schema(SchemaIsolation),
    Database(DatabaseIsolation),
    Rls(RowLevelSecurityIsolation),
}

impl TierProvider {
    fn build(
        strategy: IsolationStrategy,
        config: &Arc<TenancyConfig>,
        engine: &Arc<dyn Engine>,
        connector: &Arc<dyn Connector>,
    ) -> TenancyResult<Self> {
        let config = config.clone();
        let engine = engine.clone();
        match strategy {
            IsolationStrategy::Schema => Ok(TierProvider::Schema(SchemaIsolation::with_engine(
                config,
                engine,
                connector.clone(),
            )?)),
            IsolationStrategy::Database => Ok(TierProvider::Database(
                DatabaseIsolation::with_master(config, engine, connector.clone())?,
            )),
            IsolationStrategy::Rls => Ok(TierProvider::Rls(RowLevelSecurityIsolation::with_engine(
                config, engine,
            )?)),
            IsolationStrategy::Hybrid => Err(ConfigurationError::NestedHybrid.into()),
        }
    }

    fn provider(&self) -> &dyn IsolationProvider {
        match self {
            TierProvider::Schema(p) => p,
            TierProvider::Database(p) => p,
            TierProvider::Rls(p) => p,
        }
    }

    /// Releases engines the tier created itself; the shared engine stays.
    async fn dispose_tenant_engines(&self) {
        match self {
            TierProvider::Schema(p) => p.dispose_tenant_engines().await,
            TierProvider::Database(p) => p.dispose_tenant_engines().await,
            TierProvider::Rls(_) => {}
        }
    }
}

/// Premium tenants and standard tenants on different strategies.
pub struct HybridIsolation {
    config: Arc<TenancyConfig>,
    engine: Arc<dyn Engine>,
    premium: TierProvider,
    standard: TierProvider,
    lifecycle: Lifecycle,
}

impl fmt::Debug for HybridIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridIsolation")
            .field("engine", &self.engine.masked_url())
            .field("premium", &self.premium.provider().strategy())
            .field("standard", &self.standard.provider().strategy())
            .field("premium_tenants", &self.config.premium_tenants.len())
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl HybridIsolation {
    /// Builds the shared engine and both tiers.
    pub fn new(config: Arc<TenancyConfig>, connector: Arc<dyn Connector>) -> TenancyResult<Self> {
        config.validate_for(IsolationStrategy::Hybrid)?;
        let engine = connector
            .create_engine(&config.database_url, &config.pool)
            .map_err(|e| IsolationError::setup("create shared engine", e))?;

        let premium = TierProvider::build(config.premium_isolation_strategy, &config, &engine, &connector)?;
        let standard =
            TierProvider::build(config.standard_isolation_strategy, &config, &engine, &connector)?;

        let provider = Self {
            config,
            engine,
            premium,
            standard,
            lifecycle: Lifecycle::new(),
        };
        provider.lifecycle.mark_ready();
        info!(
            premium = %provider.config.premium_isolation_strategy,
            standard = %provider.config.standard_isolation_strategy,
            premium_tenants = provider.config.premium_tenants.len(),
            "Hybrid isolation ready with one shared engine"
        );
        Ok(provider)
    }

    /// Tier the tenant belongs to.
    pub fn tier_of(&self, tenant: &Tenant) -> Tier {
        if self.config.is_premium_tenant(tenant.id()) {
            Tier::Premium
        } else {
            Tier::Standard
        }
    }

    /// Sub-provider that serves the tenant.
    pub fn provider_for(&self, tenant: &Tenant) -> &dyn IsolationProvider {
        let tier = self.tier_of(tenant);
        debug!(tenant_id = %tenant.id(), tier = %tier, "Routing tenant");
        self.tier_provider(tier)
    }

    /// Sub-provider of a tier.
    pub fn tier_provider(&self, tier: Tier) -> &dyn IsolationProvider {
        match tier {
            Tier::Premium => self.premium.provider(),
            Tier::Standard => self.standard.provider(),
        }
    }

    fn route(&self, tenant: &Tenant) -> TenancyResult<&dyn IsolationProvider> {
        self.lifecycle.ensure_open()?;
        Ok(self.provider_for(tenant))
    }
}

#[async_trait]
impl IsolationProvider for HybridIsolation {
    fn strategy(&self) -> IsolationStrategy {
        IsolationStrategy::Hybrid
    }

    fn state(&self) -> ProviderState {
        self.lifecycle.state()
    }

    fn dialect(&self) -> Dialect {
        self.engine.dialect()
    }

    async fn acquire_session(&self, tenant: &Tenant) -> TenancyResult<TenantSession> {
        self.route(tenant)?.acquire_session(tenant).await
    }

    async fn apply_filter(&self, query: Query, tenant: &Tenant) -> TenancyResult<Query> {
        self.route(tenant)?.apply_filter(query, tenant).await
    }

    async fn initialize_tenant(
        &self,
        tenant: &Tenant,
        metadata: Option<&SchemaMetadata>,
    ) -> TenancyResult<()> {
        self.route(tenant)?.initialize_tenant(tenant, metadata).await
    }

    async fn destroy_tenant(&self, tenant: &Tenant, scope: &DestroyScope) -> TenancyResult<()> {
        self.route(tenant)?.destroy_tenant(tenant, scope).await
    }

    async fn verify_isolation(&self, tenant: &Tenant) -> TenancyResult<bool> {
        self.route(tenant)?.verify_isolation(tenant).await
    }

    fn ddl_target(&self, tenant: &Tenant) -> TenancyResult<DdlTarget> {
        self.provider_for(tenant).ddl_target(tenant)
    }

    fn pool_count(&self) -> usize {
        1 + self.premium.provider().pool_count() + self.standard.provider().pool_count()
    }

    async fn close(&self) {
        if !self.lifecycle.mark_closed() {
            return;
        }
        self.premium.dispose_tenant_engines().await;
        self.standard.dispose_tenant_engines().await;
        self.engine.dispose().await;
        info!("Hybrid isolation closed");
    }
}
