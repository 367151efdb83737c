//! Tenant model, per-task tenant context and request resolution.

mod context;
mod id;
mod model;
mod resolver;

pub use context::{ContextToken, TenantContext};
pub use id::TenantId;
pub use model::{Tenant, TenantBuilder, TenantStatus};
pub use resolver::{HeaderTenantResolver, RequestMetadata, TenantResolver};
