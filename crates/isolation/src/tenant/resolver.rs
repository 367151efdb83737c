//! Resolution of inbound requests to tenants.
//!
//! Transport parsing belongs to the embedding service. This module only
//! defines the seam ([`TenantResolver`]) and a header-based implementation
//! that consults a [`TenantRegistry`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ResolutionError, TenancyResult};
use crate::registry::TenantRegistry;
use crate::validation::validate_tenant_identifier;

use super::Tenant;

/// Transport-agnostic view of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    headers: HashMap<String, String>,
    /// Host the request was addressed to.
    pub host: Option<String>,
    /// Request path.
    pub path: Option<String>,
}

impl RequestMetadata {
    /// Creates empty request metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header. Names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Maps a request to an active tenant.
#[async_trait]
pub trait TenantResolver: Send + Sync {
    /// Resolves the tenant for a request.
    ///
    /// Fails with [`ResolutionError::ResolutionFailed`] when the request
    /// carries no usable identifier, [`ResolutionError::TenantNotFound`] when
    /// the identifier is unknown and [`ResolutionError::TenantInactive`] when
    /// the tenant may not serve traffic.
    async fn resolve(&self, request: &RequestMetadata) -> TenancyResult<Tenant>;
}

/// Resolves tenants from a request header carrying the identifier slug.
pub struct HeaderTenantResolver {
    header: String,
    registry: Arc<dyn TenantRegistry>,
}

impl HeaderTenantResolver {
    /// Header consulted when none is configured.
    pub const DEFAULT_HEADER: &'static str = "x-tenant-id";

    /// Creates a resolver reading [`DEFAULT_HEADER`](Self::DEFAULT_HEADER).
    pub fn new(registry: Arc<dyn TenantRegistry>) -> Self {
        Self::with_header(Self::DEFAULT_HEADER, registry)
    }

    /// Creates a resolver reading a custom header.
    pub fn with_header(header: impl Into<String>, registry: Arc<dyn TenantRegistry>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
            registry,
        }
    }
}

#[async_trait]
impl TenantResolver for HeaderTenantResolver {
    async fn resolve(&self, request: &RequestMetadata) -> TenancyResult<Tenant> {
        let raw = request
            .header(&self.header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ResolutionError::ResolutionFailed {
                message: format!("missing {} header", self.header),
            })?;

        if !validate_tenant_identifier(raw) {
            return Err(ResolutionError::ResolutionFailed {
                message: format!("malformed tenant identifier in {} header", self.header),
            }
            .into());
        }

        let tenant = self
            .registry
            .get_by_identifier(raw)
            .await?
            .ok_or_else(|| ResolutionError::TenantNotFound {
                identifier: raw.to_string(),
            })?;

        if !tenant.is_active() {
            return Err(ResolutionError::TenantInactive {
                identifier: raw.to_string(),
                status: tenant.status().to_string(),
            }
            .into());
        }

        tracing::debug!(tenant_id = %tenant.id(), identifier = raw, "Resolved tenant from header");
        Ok(tenant)
    }
}
