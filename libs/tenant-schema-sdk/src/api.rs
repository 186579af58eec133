//! Public API trait consumed by the rest of the application.

use async_trait::async_trait;

use crate::error::TenantSchemaError;
use crate::models::{DriftReport, TenantId};

/// Entry point for request-serving code that depends on tenant namespaces.
///
/// ```ignore
/// let schema: Arc<dyn TenantSchemaClient> = lifecycle.clone();
///
/// // Before serving any tenant-scoped request:
/// if let Err(e) = schema.ensure_tenant_ready(&tenant_id).await {
///     return if e.is_retryable() { service_unavailable() } else { internal_error() };
/// }
/// ```
#[async_trait]
pub trait TenantSchemaClient: Send + Sync {
    /// Make sure the tenant namespace exists, is migrated to the current
    /// version and matches the registry.
    ///
    /// # Errors
    ///
    /// - `NotReady` if the namespace cannot be brought to a valid state
    /// - `Internal` on unexpected engine failures
    async fn ensure_tenant_ready(&self, tenant_id: &TenantId) -> Result<(), TenantSchemaError>;

    /// Validate every namespace and aggregate the results.
    ///
    /// # Errors
    ///
    /// - `Internal` if the shared namespace or the tenant roster cannot be read
    async fn get_health_report(&self) -> Result<DriftReport, TenantSchemaError>;
}
