//! `SchemaLifecycle`: the facade wiring registry, engine, validator, healer,
//! advisor and drift reporter together, and the [`TenantSchemaClient`]
//! implementation request handlers depend on.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tenant_schema_sdk::{
    DriftReport, IndexGap, InvalidTenantId, Scope, TenantId, TenantSchemaClient, TenantSchemaError,
    TenantState, ValidationResult,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::advisor::IndexAdvisor;
use crate::backend::SchemaBackend;
use crate::config::TenantSchemaConfig;
use crate::definitions::SchemaDefinitions;
use crate::drift::DriftReporter;
use crate::error::{Result, SchemaError};
use crate::healer::{AutoHealer, HealReport};
use crate::migrations::{MigrationEngine, MigrationOutcome, MigrationStore};
use crate::registry::SchemaRegistry;
use crate::tenant::{ProvisionOutcome, TenantNamespaceManager, drift_summary};
use crate::validator::SchemaValidator;

/// Namespace addressed by an operator command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Public,
    Tenant(TenantId),
}

impl Target {
    #[must_use]
    pub fn scope(&self) -> Scope {
        match self {
            Self::Public => Scope::Shared,
            Self::Tenant(_) => Scope::PerTenant,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Tenant(id) => write!(f, "tenant '{id}'"),
        }
    }
}

/// `public` selects the shared namespace, anything else is a tenant id.
impl FromStr for Target {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s == "public" {
            return Ok(Self::Public);
        }
        TenantId::new(s).map(Self::Tenant)
    }
}

/// Result of [`SchemaLifecycle::setup`].
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub migration: MigrationOutcome,
    pub validation: ValidationResult,
}

/// Result of [`SchemaLifecycle::check`].
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub backend: &'static str,
    pub public_namespace: String,
    pub shared_entities: usize,
    pub tenant_entities: usize,
    pub shared_migrations: usize,
    pub tenant_migrations: usize,
    pub pending_shared: Vec<u32>,
    pub known_tenants: usize,
}

enum Readiness {
    Ready,
    NotReady(String),
}

/// Engine facade.
pub struct SchemaLifecycle {
    config: TenantSchemaConfig,
    backend: Arc<dyn SchemaBackend>,
    registry: Arc<SchemaRegistry>,
    engine: Arc<MigrationEngine>,
    tenants: Arc<TenantNamespaceManager>,
    validator: SchemaValidator,
    healer: AutoHealer,
    advisor: IndexAdvisor,
    drift: DriftReporter,
    ready: DashMap<TenantId, Instant>,
}

impl SchemaLifecycle {
    /// Wires every component over `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Config`] if `config` is invalid.
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        registry: SchemaRegistry,
        store: MigrationStore,
        config: TenantSchemaConfig,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(registry);
        let lock = config.lock_settings();

        let engine = Arc::new(MigrationEngine::new(
            backend.clone(),
            Arc::new(store),
            lock,
            config.statement_timeout,
        ));
        let validator = SchemaValidator::new(backend.clone(), registry.clone());
        let tenants = Arc::new(TenantNamespaceManager::new(
            backend.clone(),
            engine.clone(),
            validator.clone(),
            config.naming()?,
        ));
        let healer = AutoHealer::new(
            backend.clone(),
            registry.clone(),
            lock,
            config.statement_timeout,
            config.healing_enabled,
        );
        let advisor = IndexAdvisor::new(backend.clone(), registry.clone());
        let drift = DriftReporter::new(
            validator.clone(),
            tenants.clone(),
            config.public_namespace.clone(),
            config.drift.concurrency,
        );

        info!(
            backend = backend.kind(),
            public_namespace = %config.public_namespace,
            healing_enabled = config.healing_enabled,
            "Schema lifecycle initialized"
        );
        Ok(Self {
            config,
            backend,
            registry,
            engine,
            tenants,
            validator,
            healer,
            advisor,
            drift,
            ready: DashMap::new(),
        })
    }

    /// Loads the definitions named by `config` (or the built-in set) and
    /// wires the engine over `backend`.
    ///
    /// # Errors
    ///
    /// Configuration and registry errors.
    pub fn from_config(config: TenantSchemaConfig, backend: Arc<dyn SchemaBackend>) -> Result<Self> {
        let (registry, store) = SchemaDefinitions::load(config.definitions_path.as_deref())?.build()?;
        Self::new(backend, registry, store, config)
    }

    /// Connects to PostgreSQL using `config.database`.
    ///
    /// # Errors
    ///
    /// Configuration, registry and connection errors.
    #[cfg(feature = "pg")]
    pub async fn connect(config: TenantSchemaConfig) -> Result<Self> {
        let (registry, store) = SchemaDefinitions::load(config.definitions_path.as_deref())?.build()?;
        config.validate()?;
        info!(dsn = %config.redacted_dsn(), "Connecting to PostgreSQL");
        let backend = crate::backend::PgBackend::connect(&config.database, &config.public_namespace)
            .await
            .map_err(|e| SchemaError::backend(&config.public_namespace, e))?;
        Self::new(Arc::new(backend), registry, store, config)
    }

    #[must_use]
    pub fn config(&self) -> &TenantSchemaConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[must_use]
    pub fn tenants(&self) -> &TenantNamespaceManager {
        &self.tenants
    }

    /// Namespace a target resolves to.
    #[must_use]
    pub fn namespace_of(&self, target: &Target) -> String {
        match target {
            Target::Public => self.config.public_namespace.clone(),
            Target::Tenant(id) => self.tenants.namespace_for(id),
        }
    }

    /// Shared bootstrap: catalog tables, public namespace, shared migrations,
    /// followed by a validation of the public namespace.
    ///
    /// # Errors
    ///
    /// Any migration, lock or connection error.
    #[tracing::instrument(skip_all, fields(namespace = %self.config.public_namespace))]
    pub async fn setup(&self) -> Result<SetupReport> {
        self.engine.ensure_catalog().await?;
        let migration = self.migrate_shared().await?;
        let validation = self.validate_shared().await?;
        Ok(SetupReport {
            migration,
            validation,
        })
    }

    /// Applies pending shared migrations.
    ///
    /// # Errors
    ///
    /// Any migration, lock or connection error.
    pub async fn migrate_shared(&self) -> Result<MigrationOutcome> {
        self.engine
            .apply(Scope::Shared, &self.config.public_namespace)
            .await
    }

    /// Creates and migrates a tenant namespace.
    ///
    /// # Errors
    ///
    /// Any migration, lock or connection error.
    #[tracing::instrument(skip_all, fields(tenant = %tenant))]
    pub async fn provision(&self, tenant: &TenantId) -> Result<ProvisionOutcome> {
        self.ready.remove(tenant);
        self.tenants.provision(tenant).await
    }

    /// # Errors
    ///
    /// Connection or backend errors.
    pub async fn validate_shared(&self) -> Result<ValidationResult> {
        self.validator
            .validate(Scope::Shared, &self.config.public_namespace)
            .await
    }

    /// Validates a known tenant. A `ready` tenant that is not compliant
    /// moves to `degraded`.
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownTenant`] if the tenant was never provisioned,
    /// connection or backend errors otherwise.
    #[tracing::instrument(skip_all, fields(tenant = %tenant))]
    pub async fn validate_tenant(&self, tenant: &TenantId) -> Result<ValidationResult> {
        let record = self
            .tenants
            .record(tenant)
            .await?
            .ok_or_else(|| SchemaError::UnknownTenant(tenant.clone()))?;
        let result = self.validator.validate(Scope::PerTenant, &record.namespace).await?;
        if !result.is_compliant() {
            self.ready.remove(tenant);
            if record.state == TenantState::Ready {
                warn!(status = %result.status, "Drift detected, marking tenant degraded");
                self.tenants
                    .mark(tenant, TenantState::Degraded, Some(drift_summary(&result)))
                    .await?;
            }
        }
        Ok(result)
    }

    /// Validates every namespace and applies the `ready -> degraded`
    /// transition to drifted tenants.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared namespace or the roster cannot be read.
    pub async fn validate_all(&self) -> Result<DriftReport> {
        let mut report = self.drift.report().await?;
        for health in &mut report.tenants {
            let Some(result) = &health.result else {
                continue;
            };
            if result.is_compliant() {
                continue;
            }
            self.ready.remove(&health.tenant_id);
            if health.state == TenantState::Ready {
                self.tenants
                    .mark(&health.tenant_id, TenantState::Degraded, Some(drift_summary(result)))
                    .await?;
                health.state = TenantState::Degraded;
            }
        }
        Ok(report)
    }

    /// Read-only fleet report.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared namespace or the roster cannot be read.
    pub async fn health_report(&self) -> Result<DriftReport> {
        self.drift.report().await
    }

    /// # Errors
    ///
    /// [`SchemaError::HealingDisabled`], lock, connection or backend errors.
    pub async fn heal_shared(&self) -> Result<HealReport> {
        let current = self.validate_shared().await?;
        self.healer.heal(&current).await
    }

    /// Heals a known tenant. A healed tenant becomes `ready`; one that still
    /// drifts stays (or becomes) `degraded`.
    ///
    /// # Errors
    ///
    /// [`SchemaError::UnknownTenant`], [`SchemaError::HealingDisabled`],
    /// lock, connection or backend errors.
    #[tracing::instrument(skip_all, fields(tenant = %tenant))]
    pub async fn heal_tenant(&self, tenant: &TenantId) -> Result<HealReport> {
        let current = self.validate_tenant(tenant).await?;
        let report = self.healer.heal(&current).await?;
        if report.is_healed() {
            self.tenants.mark(tenant, TenantState::Ready, None).await?;
        } else {
            self.ready.remove(tenant);
            self.tenants
                .mark(tenant, TenantState::Degraded, Some(drift_summary(&report.after)))
                .await?;
        }
        Ok(report)
    }

    /// Declared indexes missing from the target namespace.
    ///
    /// # Errors
    ///
    /// Connection or backend errors.
    pub async fn advise(&self, target: &Target) -> Result<Vec<IndexGap>> {
        self.advisor
            .analyze(target.scope(), &self.namespace_of(target))
            .await
    }

    /// Versions not yet applied to the target namespace.
    ///
    /// # Errors
    ///
    /// Ledger consistency, connection or backend errors.
    pub async fn pending(&self, target: &Target) -> Result<Vec<u32>> {
        self.engine
            .pending(target.scope(), &self.namespace_of(target))
            .await
    }

    /// Connectivity and definition summary.
    ///
    /// # Errors
    ///
    /// Connection, backend or ledger consistency errors.
    pub async fn check(&self) -> Result<CheckReport> {
        self.engine.ensure_catalog().await?;
        let store = self.engine.store();
        Ok(CheckReport {
            backend: self.backend.kind(),
            public_namespace: self.config.public_namespace.clone(),
            shared_entities: self.registry.count(Scope::Shared),
            tenant_entities: self.registry.count(Scope::PerTenant),
            shared_migrations: store.migrations(Scope::Shared).len(),
            tenant_migrations: store.migrations(Scope::PerTenant).len(),
            pending_shared: self.pending(&Target::Public).await?,
            known_tenants: self.tenants.list().await?.len(),
        })
    }

    fn cached_ready(&self, tenant: &TenantId) -> bool {
        let fresh = self
            .ready
            .get(tenant)
            .is_some_and(|at| at.elapsed() < self.config.ready_cache_ttl);
        if !fresh {
            self.ready.remove(tenant);
        }
        fresh
    }

    async fn make_ready(&self, tenant: &TenantId) -> Result<Readiness> {
        let record = self.tenants.record(tenant).await?;
        let namespace = self.tenants.namespace_for(tenant);

        let up_to_date = match &record {
            Some(r) if r.state == TenantState::Ready => {
                self.engine.pending(Scope::PerTenant, &namespace).await?.is_empty()
            }
            _ => false,
        };
        if !up_to_date {
            self.tenants.provision(tenant).await?;
        }

        let result = self.validator.validate(Scope::PerTenant, &namespace).await?;
        if result.is_compliant() {
            return Ok(Readiness::Ready);
        }

        if !self.healer.is_enabled() {
            let reason = drift_summary(&result);
            self.tenants
                .mark(tenant, TenantState::Degraded, Some(reason.clone()))
                .await?;
            return Ok(Readiness::NotReady(format!("{reason}; healing is disabled")));
        }

        let report = self.healer.heal(&result).await?;
        if report.is_healed() {
            info!(repairs = report.actions.len(), "Tenant healed");
            self.tenants.mark(tenant, TenantState::Ready, None).await?;
            return Ok(Readiness::Ready);
        }

        let mut reason = drift_summary(&report.after);
        for refused in report.unsafe_errors() {
            reason.push_str("; ");
            reason.push_str(&refused.to_string());
        }
        self.tenants
            .mark(tenant, TenantState::Degraded, Some(reason.clone()))
            .await?;
        Ok(Readiness::NotReady(reason))
    }
}

#[async_trait]
impl TenantSchemaClient for SchemaLifecycle {
    #[tracing::instrument(skip_all, fields(tenant = %tenant_id))]
    async fn ensure_tenant_ready(&self, tenant_id: &TenantId) -> std::result::Result<(), TenantSchemaError> {
        if self.cached_ready(tenant_id) {
            return Ok(());
        }

        let retry = &self.config.retry;
        let mut backoff = retry.initial_backoff;
        let mut attempt = 1;
        loop {
            match self.make_ready(tenant_id).await {
                Ok(Readiness::Ready) => {
                    self.ready.insert(tenant_id.clone(), Instant::now());
                    debug!(attempt, "Tenant ready");
                    return Ok(());
                }
                Ok(Readiness::NotReady(reason)) => {
                    warn!(%reason, "Tenant is not ready");
                    return Err(TenantSchemaError::NotReady {
                        tenant_id: tenant_id.clone(),
                        reason,
                        retryable: false,
                    });
                }
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    warn!(attempt, error = %err, ?backoff, "Transient failure, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2).min(retry.max_backoff);
                    attempt += 1;
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Tenant could not be made ready");
                    return Err(client_error(tenant_id, &err));
                }
            }
        }
    }

    async fn get_health_report(&self) -> std::result::Result<DriftReport, TenantSchemaError> {
        self.health_report()
            .await
            .map_err(|e| TenantSchemaError::Internal(e.to_string()))
    }
}

fn client_error(tenant: &TenantId, err: &SchemaError) -> TenantSchemaError {
    match err {
        SchemaError::Connection(_) | SchemaError::LockContention { .. } => TenantSchemaError::NotReady {
            tenant_id: tenant.clone(),
            reason: err.to_string(),
            retryable: true,
        },
        SchemaError::MigrationFailed { .. }
        | SchemaError::HealingUnsafe { .. }
        | SchemaError::HealingDisabled { .. }
        | SchemaError::ChecksumMismatch { .. }
        | SchemaError::OutOfOrder { .. }
        | SchemaError::Backend { .. } => TenantSchemaError::NotReady {
            tenant_id: tenant.clone(),
            reason: err.to_string(),
            retryable: false,
        },
        SchemaError::RegistryInconsistency(_)
        | SchemaError::InvalidIdentifier { .. }
        | SchemaError::UnknownTenant(_)
        | SchemaError::Config(_) => TenantSchemaError::Internal(err.to_string()),
    }
}
