//! Per-unit-of-work tenant context.
//!
//! The active tenant lives in a tokio task-local frame, so concurrently
//! running tasks never observe each other's tenant even when the runtime
//! moves them between worker threads. A frame is installed by
//! [`TenantContext::scope`] (or [`TenantContext::unit_of_work`]) and dropped
//! when the scoped future completes, panics or is cancelled, which restores
//! whatever frame enclosed it.
//!
//! # Example
//!
//! ```
//! use tenantry_isolation::tenant::{Tenant, TenantContext};
//!
//! # tokio_test::block_on(async {
//! let acme = Tenant::new("t1", "acme-corp");
//!
//! TenantContext::scope(acme, async {
//!     let current = TenantContext::get().unwrap();
//!     assert_eq!(current.identifier(), "acme-corp");
//!
//!     TenantContext::set_metadata("request_id", serde_json::json!("r-9")).unwrap();
//! })
//! .await;
//!
//! assert!(TenantContext::get_optional().is_none());
//! # });
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::ContextError;

use super::Tenant;

tokio::task_local! {
    static CURRENT: RefCell<Frame>;
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Default)]
struct Frame {
    id: u64,
    tenant: Option<Arc<Tenant>>,
    metadata: HashMap<String, Value>,
}

impl Frame {
    fn new(tenant: Option<Arc<Tenant>>, metadata: HashMap<String, Value>) -> Self {
        Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            tenant,
            metadata,
        }
    }
}

/// Handle returned by [`TenantContext::set`], used to restore the previous tenant.
#[must_use = "pass the token to TenantContext::reset to restore the previous tenant"]
#[derive(Debug)]
pub struct ContextToken {
    frame_id: u64,
    previous: Option<Arc<Tenant>>,
}

/// Access to the tenant bound to the current unit of work.
///
/// All functions are associated functions; there is no instance to pass
/// around. Outside any scope, reads return `None` or the supplied default
/// and writes fail with [`ContextError::NoActiveScope`].
#[derive(Debug, Clone, Copy)]
pub struct TenantContext;

impl TenantContext {
    /// Runs `fut` with `tenant` active and an empty metadata map.
    ///
    /// The enclosing tenant and metadata are visible again once `fut`
    /// finishes, on every exit path.
    pub async fn scope<F>(tenant: impl Into<Arc<Tenant>>, fut: F) -> F::Output
    where
        F: Future,
    {
        let frame = Frame::new(Some(tenant.into()), HashMap::new());
        CURRENT.scope(RefCell::new(frame), fut).await
    }

    /// Synchronous variant of [`scope`](Self::scope) for blocking code.
    pub fn scope_sync<R>(tenant: impl Into<Arc<Tenant>>, f: impl FnOnce() -> R) -> R {
        let frame = Frame::new(Some(tenant.into()), HashMap::new());
        CURRENT.sync_scope(RefCell::new(frame), f)
    }

    /// Runs `fut` in a fresh frame with no tenant.
    ///
    /// Use this at the start of a unit of work whose tenant is resolved
    /// later through [`set`](Self::set).
    pub async fn unit_of_work<F>(fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT
            .scope(RefCell::new(Frame::new(None, HashMap::new())), fut)
            .await
    }

    /// Carries the current tenant and metadata into a future that will run
    /// as a separate task.
    ///
    /// Task-local state is not inherited by `tokio::spawn`; wrap the spawned
    /// future with this to propagate it. The copy is independent of the
    /// caller's frame.
    pub fn bind<F>(fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        let (tenant, metadata) = CURRENT
            .try_with(|cell| {
                let frame = cell.borrow();
                (frame.tenant.clone(), frame.metadata.clone())
            })
            .unwrap_or_default();
        CURRENT.scope(RefCell::new(Frame::new(tenant, metadata)), fut)
    }

    /// Replaces the active tenant within the current frame.
    pub fn set(tenant: impl Into<Arc<Tenant>>) -> Result<ContextToken, ContextError> {
        let tenant = tenant.into();
        CURRENT
            .try_with(|cell| {
                let mut frame = cell.borrow_mut();
                let previous = frame.tenant.replace(tenant);
                ContextToken {
                    frame_id: frame.id,
                    previous,
                }
            })
            .map_err(|_| ContextError::NoActiveScope)
    }

    /// Restores the tenant that was active before the matching [`set`](Self::set).
    pub fn reset(token: ContextToken) -> Result<(), ContextError> {
        CURRENT
            .try_with(|cell| {
                let mut frame = cell.borrow_mut();
                if frame.id != token.frame_id {
                    return Err(ContextError::ForeignToken);
                }
                frame.tenant = token.previous;
                Ok(())
            })
            .map_err(|_| ContextError::NoActiveScope)?
    }

    /// Returns the active tenant.
    pub fn get() -> Result<Arc<Tenant>, ContextError> {
        Self::get_optional().ok_or(ContextError::TenantNotSet)
    }

    /// Returns the active tenant, if any.
    pub fn get_optional() -> Option<Arc<Tenant>> {
        CURRENT
            .try_with(|cell| cell.borrow().tenant.clone())
            .ok()
            .flatten()
    }

    /// Returns `true` if a tenant is active.
    pub fn is_active() -> bool {
        Self::get_optional().is_some()
    }

    /// Clears the tenant and metadata of the current frame.
    pub fn clear() {
        let _ = CURRENT.try_with(|cell| {
            let mut frame = cell.borrow_mut();
            frame.tenant = None;
            frame.metadata.clear();
        });
    }

    /// Stores one metadata entry in the current frame.
    pub fn set_metadata(key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        let key = key.into();
        CURRENT
            .try_with(|cell| {
                cell.borrow_mut().metadata.insert(key, value);
            })
            .map_err(|_| ContextError::NoActiveScope)
    }

    /// Returns one metadata entry, or `default` if it is absent.
    pub fn get_metadata(key: &str, default: Value) -> Value {
        CURRENT
            .try_with(|cell| cell.borrow().metadata.get(key).cloned())
            .ok()
            .flatten()
            .unwrap_or(default)
    }

    /// Returns a copy of all metadata in the current frame.
    pub fn get_all_metadata() -> HashMap<String, Value> {
        CURRENT
            .try_with(|cell| cell.borrow().metadata.clone())
            .unwrap_or_default()
    }

    /// Removes all metadata from the current frame.
    pub fn clear_metadata() {
        let _ = CURRENT.try_with(|cell| cell.borrow_mut().metadata.clear());
    }
}
