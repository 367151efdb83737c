//! Strategy selection.
//!
//! Maps an [`IsolationStrategy`] (or its configured name) to a concrete
//! provider. Configuration is validated for the chosen strategy first, so a
//! misconfigured process fails before any engine is built.
//!
//! ```
//! use std::sync::Arc;
//! use tenantry_isolation::{IsolationProvider, IsolationProviderFactory, IsolationStrategy, TenancyConfig};
//!
//! let config = TenancyConfig::new("sqlite://:memory:").with_strategy(IsolationStrategy::Rls);
//! let provider = IsolationProviderFactory::from_config(Arc::new(config))?;
//! assert_eq!(provider.strategy(), IsolationStrategy::Rls);
//! assert!(IsolationProviderFactory::from_name("sharding", provider_config()).is_err());
//!
//! # fn provider_config() -> Arc<TenancyConfig> {
//! #     Arc::new(TenancyConfig::new("sqlite://:memory:"))
//! # }
//! # Ok::<(), tenantry_isolation::TenancyError>(())
//! ```

use std::sync::Arc;

use crate::config::{IsolationStrategy, TenancyConfig};
use crate::engine::{Connector, DefaultConnector};
use crate::error::TenancyResult;

use super::{
    DatabaseIsolation, HybridIsolation, IsolationProvider, RowLevelSecurityIsolation,
    SchemaIsolation,
};

/// Builds providers from configuration. Call once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsolationProviderFactory;

impl IsolationProviderFactory {
    /// Builds the provider for `strategy` with the bundled drivers.
    pub fn create(
        strategy: IsolationStrategy,
        config: Arc<TenancyConfig>,
    ) -> TenancyResult<Arc<dyn IsolationProvider>> {
        Self::create_with_connector(strategy, config, Arc::new(DefaultConnector))
    }

    /// Builds the provider for `strategy`, creating engines through `connector`.
    ///
    /// The configuration is validated for `strategy` before any engine exists.
    pub fn create_with_connector(
        strategy: IsolationStrategy,
        config: Arc<TenancyConfig>,
        connector: Arc<dyn Connector>,
    ) -> TenancyResult<Arc<dyn IsolationProvider>> {
        config.validate_for(strategy)?;
        let provider: Arc<dyn IsolationProvider> = match strategy {
            IsolationStrategy::Schema => Arc::new(SchemaIsolation::new(config, connector)?),
            IsolationStrategy::Database => Arc::new(DatabaseIsolation::new(config, connector)?),
            IsolationStrategy::Rls => Arc::new(RowLevelSecurityIsolation::new(config, connector)?),
            IsolationStrategy::Hybrid => Arc::new(HybridIsolation::new(config, connector)?),
        };
        tracing::info!(strategy = %strategy, dialect = %provider.dialect(), "Created isolation provider");
        Ok(provider)
    }

    /// Builds the provider named by the configuration's own strategy.
    pub fn from_config(config: Arc<TenancyConfig>) -> TenancyResult<Arc<dyn IsolationProvider>> {
        Self::create(config.isolation_strategy, config)
    }

    /// Builds a provider from a strategy name such as `"schema"` or `"rls"`.
    pub fn from_name(name: &str, config: Arc<TenancyConfig>) -> TenancyResult<Arc<dyn IsolationProvider>> {
        let strategy: IsolationStrategy = name.parse()?;
        Self::create(strategy, config)
    }
}
