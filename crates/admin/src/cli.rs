//! Command-line configuration for the `tenantry` admin tool.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TENANTRY_DATABASE_URL` | sqlite:///tenantry.db | Shared (or master) database |
//! | `TENANTRY_STRATEGY` | schema | Isolation strategy |
//! | `TENANTRY_SCHEMA_PREFIX` | tenant_ | Prefix of tenant schema names |
//! | `TENANTRY_DATABASE_URL_TEMPLATE` | - | Per-tenant database URL template |
//! | `TENANTRY_TENANT_DATABASE_DIR` | - | Directory for per-tenant SQLite files |
//! | `TENANTRY_PREMIUM_TENANTS` | - | Comma-separated premium tenant ids |
//! | `TENANTRY_PREMIUM_STRATEGY` | schema | Hybrid strategy for premium tenants |
//! | `TENANTRY_STANDARD_STRATEGY` | rls | Hybrid strategy for everyone else |
//! | `TENANTRY_TENANT_COLUMN` | tenant_id | Tenant column of shared tables |
//! | `TENANTRY_MAX_CONNECTIONS` | 5 | Pool size per engine |
//! | `TENANTRY_LOG_LEVEL` | info | Log level |

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tenantry_isolation::config::mask_url;
use tenantry_isolation::dialect::table_name_prefix;
use tenantry_isolation::error::ConfigurationError;
use tenantry_isolation::validation::{
    sanitize_identifier, validate_database_name, validate_schema_name, validate_tenant_identifier,
};
use tenantry_isolation::{IsolationStrategy, PoolSettings, TenancyConfig, Tenant, TenantId};

/// Admin tool configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "tenantry")]
#[command(about = "Provision, verify and destroy isolated tenants", version)]
pub struct AdminConfig {
    /// Shared (or master) database URL.
    #[arg(long, env = "TENANTRY_DATABASE_URL", default_value = "sqlite:///tenantry.db")]
    pub database_url: String,

    /// Isolation strategy (schema, database, rls, hybrid).
    #[arg(long, env = "TENANTRY_STRATEGY", default_value = "schema")]
    pub strategy: String,

    /// Prefix of tenant schema names.
    #[arg(long, env = "TENANTRY_SCHEMA_PREFIX", default_value = "tenant_")]
    pub schema_prefix: String,

    /// Per-tenant database URL template with {tenant_id} or {database_name}.
    #[arg(long, env = "TENANTRY_DATABASE_URL_TEMPLATE")]
    pub database_url_template: Option<String>,

    /// Directory for per-tenant SQLite files.
    #[arg(long, env = "TENANTRY_TENANT_DATABASE_DIR")]
    pub tenant_database_dir: Option<PathBuf>,

    /// Premium tenant ids (comma-separated).
    #[arg(long, env = "TENANTRY_PREMIUM_TENANTS", default_value = "")]
    pub premium_tenants: String,

    /// Hybrid strategy for premium tenants.
    #[arg(long, env = "TENANTRY_PREMIUM_STRATEGY", default_value = "schema")]
    pub premium_strategy: String,

    /// Hybrid strategy for standard tenants.
    #[arg(long, env = "TENANTRY_STANDARD_STRATEGY", default_value = "rls")]
    pub standard_strategy: String,

    /// Tenant column of shared tables.
    #[arg(long, env = "TENANTRY_TENANT_COLUMN", default_value = "tenant_id")]
    pub tenant_column: String,

    /// Pool size per engine.
    #[arg(long, env = "TENANTRY_MAX_CONNECTIONS", default_value = "5")]
    pub max_connections: u32,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "TENANTRY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Admin subcommands.
#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Report whether an identifier is safe and what names it maps to.
    Check {
        /// Tenant identifier to check.
        identifier: String,
    },
    /// Create a tenant's namespace and, optionally, its tables.
    Provision {
        #[command(flatten)]
        tenant: TenantArgs,
        /// JSON table metadata to create.
        #[arg(long)]
        schema_file: Option<PathBuf>,
    },
    /// Irreversibly delete a tenant's data.
    Destroy {
        #[command(flatten)]
        tenant: TenantArgs,
        /// Tables to clear (comma-separated).
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// JSON table metadata naming the tables to clear.
        #[arg(long)]
        schema_file: Option<PathBuf>,
        /// Confirm the destruction.
        #[arg(long)]
        yes: bool,
    },
    /// Check that a tenant's namespace exists and binds.
    Verify {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Print where migrations for a tenant must run.
    Target {
        #[command(flatten)]
        tenant: TenantArgs,
    },
    /// Print the effective configuration with secrets masked.
    Config,
}

/// Tenant selection shared by the subcommands.
#[derive(Debug, Clone, Args)]
pub struct TenantArgs {
    /// Tenant identifier (slug).
    #[arg(long)]
    pub identifier: String,

    /// Tenant id. Defaults to the identifier.
    #[arg(long)]
    pub id: Option<TenantId>,

    /// Schema name override.
    #[arg(long)]
    pub schema_name: Option<String>,

    /// Dedicated database URL override.
    #[arg(long)]
    pub tenant_database_url: Option<String>,
}

impl TenantArgs {
    /// Builds the tenant value the providers operate on.
    pub fn to_tenant(&self) -> Tenant {
        let id = self
            .id
            .clone()
            .unwrap_or_else(|| TenantId::new(self.identifier.clone()));
        let mut builder = Tenant::builder(id, self.identifier.clone());
        if let Some(schema) = &self.schema_name {
            builder = builder.schema_name(schema.clone());
        }
        if let Some(url) = &self.tenant_database_url {
            builder = builder.database_url(url.clone());
        }
        builder.build()
    }
}

impl AdminConfig {
    /// Parsed isolation strategy.
    pub fn strategy(&self) -> Result<IsolationStrategy, ConfigurationError> {
        self.strategy.parse()
    }

    /// Builds the library configuration.
    pub fn tenancy_config(&self) -> Result<TenancyConfig, ConfigurationError> {
        let mut config = TenancyConfig::new(self.database_url.clone())
            .with_strategy(self.strategy()?)
            .with_schema_prefix(self.schema_prefix.clone())
            .with_tenant_column(self.tenant_column.clone())
            .with_hybrid_strategies(self.premium_strategy.parse()?, self.standard_strategy.parse()?)
            .with_pool(PoolSettings {
                max_connections: self.max_connections,
                ..PoolSettings::default()
            });
        if let Some(template) = &self.database_url_template {
            config = config.with_database_url_template(template.clone());
        }
        if let Some(dir) = &self.tenant_database_dir {
            config = config.with_tenant_database_dir(dir.clone());
        }
        for id in self
            .premium_tenants
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            let id = TenantId::parse(id).map_err(|e| ConfigurationError::InvalidValue {
                field: "premium_tenants".to_string(),
                message: e.to_string(),
            })?;
            config = config.with_premium_tenant(id);
        }
        Ok(config)
    }

    /// Validates the options, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("Max connections cannot be 0".to_string());
        }
        for (name, value) in [
            ("strategy", &self.strategy),
            ("premium strategy", &self.premium_strategy),
            ("standard strategy", &self.standard_strategy),
        ] {
            if let Err(e) = value.parse::<IsolationStrategy>() {
                errors.push(format!("Invalid {name}: {e}"));
            }
        }
        if errors.is_empty() {
            match self.tenancy_config() {
                Ok(config) => {
                    if let Err(e) = config.validate() {
                        errors.push(e.to_string());
                    }
                }
                Err(e) => errors.push(e.to_string()),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Identifier report printed by `tenantry check`.
pub fn check_report(config: &TenancyConfig, identifier: &str) -> Value {
    let schema_name = config.schema_name_for(identifier);
    let database_name = config.database_name_for(identifier);
    json!({
        "identifier": identifier,
        "valid": validate_tenant_identifier(identifier),
        "sanitized": sanitize_identifier(identifier),
        "schema_name": schema_name,
        "schema_name_valid": validate_schema_name(&schema_name),
        "database_name": database_name,
        "database_name_valid": validate_database_name(&database_name),
        "table_prefix": table_name_prefix(identifier),
    })
}

/// Effective configuration printed by `tenantry config`.
pub fn masked_config(config: &TenancyConfig) -> Value {
    let mut value = serde_json::to_value(config).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.insert("database_url".to_string(), json!(config.masked_database_url()));
        if let Some(template) = &config.database_url_template {
            map.insert("database_url_template".to_string(), json!(mask_url(template)));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AdminConfig {
        AdminConfig::try_parse_from(std::iter::once("tenantry").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_hybrid_options_build_config() {
        let config = parse(&[
            "--database-url",
            "sqlite://:memory:",
            "--strategy",
            "hybrid",
            "--premium-tenants",
            "t1, t2,",
            "verify",
            "--identifier",
            "acme-corp",
        ]);
        assert!(config.validate().is_ok());
        let tenancy = config.tenancy_config().unwrap();
        assert_eq!(tenancy.isolation_strategy, IsolationStrategy::Hybrid);
        assert_eq!(tenancy.premium_tenants.len(), 2);
        assert!(tenancy.is_premium_tenant(&"t2".into()));

        match config.command {
            Command::Verify { tenant } => {
                let tenant = tenant.to_tenant();
                assert_eq!(tenant.id().as_str(), "acme-corp");
                assert_eq!(tenant.identifier(), "acme-corp");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_validate_collects_errors() {
        let config = parse(&[
            "--strategy",
            "sharded",
            "--max-connections",
            "0",
            "config",
        ]);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);

        let config = parse(&[
            "--database-url",
            "sqlite://:memory:",
            "--strategy",
            "hybrid",
            "--premium-strategy",
            "rls",
            "config",
        ]);
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("must differ"));
    }

    #[test]
    fn test_check_report_flags_injection() {
        let config = TenancyConfig::new("sqlite://:memory:");
        let report = check_report(&config, "'; DROP TABLE tenants; --");
        assert_eq!(report["valid"], false);

        let report = check_report(&config, "acme-corp");
        assert_eq!(report["valid"], true);
        assert_eq!(report["schema_name"], "tenant_acme_corp");
        assert_eq!(report["table_prefix"], "t_acme_corp_6a3f9342__");
    }

    #[test]
    fn test_masked_config_hides_password() {
        let config = TenancyConfig::new("postgresql://app:secret@db/saas")
            .with_database_url_template("postgresql://app:secret@db/{database_name}");
        let rendered = masked_config(&config).to_string();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("schema_prefix"));
    }
}
