//! Tenantry admin tool
//!
//! Operator entry point for the isolation providers: check identifiers,
//! provision and destroy tenant namespaces, verify them, and show where
//! migrations for a tenant must run.
//!
//! ```bash
//! tenantry check acme-corp
//! tenantry --strategy database provision --identifier acme-corp --schema-file tables.json
//! tenantry --strategy rls destroy --identifier acme-corp --tables orders,items --yes
//! ```

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use serde_json::json;
use tenantry_isolation::metadata::SchemaMetadata;
use tenantry_isolation::{DestroyScope, IsolationProvider, IsolationProviderFactory};
use tracing::{error, info, warn};

use crate::cli::{AdminConfig, Command, check_report, masked_config};

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tenantry={},tenantry_isolation={}", level, level))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_metadata(path: &Path) -> anyhow::Result<SchemaMetadata> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading schema file {}", path.display()))?;
    let metadata: SchemaMetadata = serde_json::from_str(&raw)
        .with_context(|| format!("parsing schema file {}", path.display()))?;
    metadata
        .validate()
        .with_context(|| format!("validating schema file {}", path.display()))?;
    Ok(metadata)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AdminConfig::parse();

    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let tenancy = Arc::new(config.tenancy_config()?);

    match &config.command {
        Command::Check { identifier } => return print_json(&check_report(&tenancy, identifier)),
        Command::Config => return print_json(&masked_config(&tenancy)),
        _ => {}
    }

    let provider = IsolationProviderFactory::from_config(tenancy.clone())?;
    info!(
        strategy = %provider.strategy(),
        database_url = %tenancy.masked_database_url(),
        "Provider ready"
    );

    let result = run(provider.as_ref(), &config.command).await;
    provider.close().await;
    if let Err(e) = &result {
        error!(error = %e, "Command failed");
    }
    result
}

async fn run(provider: &dyn IsolationProvider, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Provision {
            tenant,
            schema_file,
        } => {
            let tenant = tenant.to_tenant();
            let metadata = schema_file.as_deref().map(load_metadata).transpose()?;
            provider.initialize_tenant(&tenant, metadata.as_ref()).await?;
            let target = provider.ddl_target(&tenant)?;
            print_json(&json!({
                "tenant_id": tenant.id(),
                "provisioned": true,
                "tables": metadata.as_ref().map(SchemaMetadata::table_names).unwrap_or_default(),
                "target": target.masked(),
            }))
        }
        Command::Destroy {
            tenant,
            tables,
            schema_file,
            yes,
        } => {
            let tenant = tenant.to_tenant();
            if !yes {
                bail!(
                    "refusing to destroy tenant {} without --yes",
                    tenant.identifier()
                );
            }
            let mut scope = match schema_file {
                Some(path) => DestroyScope::metadata(load_metadata(path)?),
                None => DestroyScope::none(),
            };
            scope = scope.with_tables(tables.iter().cloned());
            warn!(tenant_id = %tenant.id(), "Destroying tenant data");
            provider.destroy_tenant(&tenant, &scope).await?;
            print_json(&json!({
                "tenant_id": tenant.id(),
                "destroyed": true,
            }))
        }
        Command::Verify { tenant } => {
            let tenant = tenant.to_tenant();
            let isolated = provider.verify_isolation(&tenant).await?;
            print_json(&json!({
                "tenant_id": tenant.id(),
                "isolated": isolated,
            }))?;
            if !isolated {
                bail!("tenant {} is not isolated", tenant.identifier());
            }
            Ok(())
        }
        Command::Target { tenant } => {
            let tenant = tenant.to_tenant();
            let target = provider.ddl_target(&tenant)?;
            print_json(&serde_json::to_value(target.masked())?)
        }
        Command::Check { .. } | Command::Config => Ok(()),
    }
}
