//! Tenant namespace provisioning and lifecycle state.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tenant_schema_sdk::{Scope, TenantId, TenantState, ValidationResult};
use tracing::{info, warn};

use crate::backend::{NamespaceLock, SchemaBackend, TenantRecord};
use crate::error::{Result, SchemaError};
use crate::ident::{NamespaceNaming, lock_key};
use crate::migrations::{MigrationEngine, MigrationOutcome};
use crate::validator::SchemaValidator;

/// Result of [`TenantNamespaceManager::provision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub tenant_id: TenantId,
    pub namespace: String,
    /// `true` if this call created the namespace.
    pub created: bool,
    pub migration: MigrationOutcome,
    pub state: TenantState,
}

/// Creates tenant namespaces and tracks their lifecycle state.
pub struct TenantNamespaceManager {
    backend: Arc<dyn SchemaBackend>,
    engine: Arc<MigrationEngine>,
    validator: SchemaValidator,
    naming: NamespaceNaming,
}

impl TenantNamespaceManager {
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        engine: Arc<MigrationEngine>,
        validator: SchemaValidator,
        naming: NamespaceNaming,
    ) -> Self {
        Self {
            backend,
            engine,
            validator,
            naming,
        }
    }

    #[must_use]
    pub fn namespace_for(&self, tenant: &TenantId) -> String {
        self.naming.namespace_for(tenant)
    }

    /// Brings a tenant namespace to the latest per-tenant version.
    ///
    /// Idempotent: a ready tenant only gets its pending migrations, if any.
    /// The tenant ends `ready` only if the namespace validates compliant after
    /// the migrations; otherwise it is recorded `degraded` with the drift.
    ///
    /// # Errors
    ///
    /// Propagates lock, connection and migration errors. Failures after the
    /// lock was taken leave the tenant `degraded` with the error text.
    pub async fn provision(&self, tenant: &TenantId) -> Result<ProvisionOutcome> {
        self.engine.ensure_catalog().await?;
        let namespace = self.namespace_for(tenant);
        let lock = NamespaceLock::acquire(
            self.backend.as_ref(),
            &lock_key(Scope::PerTenant, &namespace),
            &namespace,
            self.engine.lock_settings(),
        )
        .await?;

        let res = self.provision_locked(tenant, &namespace).await;
        if let Err(err) = &res
            && !err.is_transient()
        {
            warn!(tenant = %tenant, namespace, error = %err, "Provisioning failed, marking tenant degraded");
            if let Err(e) = self
                .save(tenant, &namespace, TenantState::Degraded, Some(err.to_string()))
                .await
            {
                warn!(tenant = %tenant, error = %e, "Could not record degraded state");
            }
        }
        lock.release().await;
        res
    }

    async fn provision_locked(&self, tenant: &TenantId, namespace: &str) -> Result<ProvisionOutcome> {
        self.save(tenant, namespace, TenantState::Provisioning, None).await?;
        let created = self
            .backend
            .create_namespace(namespace)
            .await
            .map_err(|e| SchemaError::backend(namespace, e))?;
        if created {
            info!(tenant = %tenant, namespace, "Tenant namespace created");
        }

        self.save(tenant, namespace, TenantState::Migrating, None).await?;
        let migration = self.engine.apply_locked(Scope::PerTenant, namespace).await?;

        let result = self.validator.validate(Scope::PerTenant, namespace).await?;
        let state = if result.is_compliant() {
            self.save(tenant, namespace, TenantState::Ready, None).await?;
            info!(
                tenant = %tenant,
                namespace,
                applied = migration.applied,
                "Tenant provisioned"
            );
            TenantState::Ready
        } else {
            let reason = drift_summary(&result);
            warn!(tenant = %tenant, namespace, %reason, "Tenant migrated but drifted, keeping it degraded");
            self.save(tenant, namespace, TenantState::Degraded, Some(reason))
                .await?;
            TenantState::Degraded
        };

        Ok(ProvisionOutcome {
            tenant_id: tenant.clone(),
            namespace: namespace.to_owned(),
            created,
            migration,
            state,
        })
    }

    /// Persisted record of a tenant, if any.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the tenant table cannot be read.
    pub async fn record(&self, tenant: &TenantId) -> Result<Option<TenantRecord>> {
        self.engine.ensure_catalog().await?;
        self.backend
            .load_tenant(tenant)
            .await
            .map_err(|e| SchemaError::backend(&self.namespace_for(tenant), e))
    }

    /// Current state; `absent` for unknown tenants.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the tenant table cannot be read.
    pub async fn state(&self, tenant: &TenantId) -> Result<TenantState> {
        Ok(self.record(tenant).await?.map(|r| r.state).unwrap_or_default())
    }

    /// Every known tenant, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the tenant table cannot be read.
    pub async fn list(&self) -> Result<Vec<TenantRecord>> {
        self.engine.ensure_catalog().await?;
        self.backend
            .list_tenants()
            .await
            .map_err(|e| SchemaError::backend("<tenants>", e))
    }

    /// Records a state transition decided elsewhere (validation, healing).
    ///
    /// # Errors
    ///
    /// Returns a backend error if the record cannot be written.
    pub async fn mark(&self, tenant: &TenantId, state: TenantState, last_error: Option<String>) -> Result<()> {
        self.engine.ensure_catalog().await?;
        let namespace = self.namespace_for(tenant);
        self.save(tenant, &namespace, state, last_error).await
    }

    async fn save(
        &self,
        tenant: &TenantId,
        namespace: &str,
        state: TenantState,
        last_error: Option<String>,
    ) -> Result<()> {
        let record = TenantRecord {
            tenant_id: tenant.clone(),
            namespace: namespace.to_owned(),
            state,
            last_error,
            updated_at: Utc::now(),
        };
        self.backend
            .save_tenant(&record)
            .await
            .map_err(|e| SchemaError::backend(namespace, e))
    }
}

/// One-line description of what drifted, stored as the tenant's last error.
pub(crate) fn drift_summary(result: &ValidationResult) -> String {
    if !result.namespace_exists {
        return format!("namespace '{}' is missing", result.namespace);
    }
    let mut parts = Vec::new();
    for diff in &result.diffs {
        if diff.table_missing {
            parts.push(format!("table {} missing", diff.entity));
            continue;
        }
        parts.extend(diff.missing_columns.iter().map(|c| format!("column {}.{c} missing", diff.entity)));
        parts.extend(diff.missing_indexes.iter().map(|i| format!("index {i} missing")));
        parts.extend(
            diff.type_mismatches
                .iter()
                .map(|m| format!("column {}.{} is {}", diff.entity, m.column, m.actual)),
        );
    }
    format!("{} drift: {}", result.status, parts.join(", "))
}
