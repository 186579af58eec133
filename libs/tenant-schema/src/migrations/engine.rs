use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tenant_schema_sdk::Scope;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::definition::MigrationDefinition;
use super::store::MigrationStore;
use super::LedgerEntry;
use crate::backend::{ChangeBatch, LedgerWrite, LockSettings, NamespaceLock, SchemaBackend};
use crate::error::{BackendErrorKind, Result, SchemaError};
use crate::ident::lock_key;

/// Result of one migration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationOutcome {
    pub scope: Scope,
    pub namespace: String,
    /// Number of migrations applied by this run.
    pub applied: usize,
    /// Number of migrations already present in the ledger.
    pub skipped: usize,
    pub applied_versions: Vec<u32>,
}

/// Applies pending migrations to one namespace at a time.
pub struct MigrationEngine {
    backend: Arc<dyn SchemaBackend>,
    store: Arc<MigrationStore>,
    lock: LockSettings,
    statement_timeout: Duration,
    catalog: OnceCell<()>,
}

impl MigrationEngine {
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        store: Arc<MigrationStore>,
        lock: LockSettings,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            lock,
            statement_timeout,
            catalog: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &MigrationStore {
        &self.store
    }

    #[must_use]
    pub fn lock_settings(&self) -> LockSettings {
        self.lock
    }

    /// Creates the ledger and tenant tables once per engine.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Connection`] or [`SchemaError::Backend`] if the
    /// tables cannot be created. A failed attempt is retried on the next call.
    pub async fn ensure_catalog(&self) -> Result<()> {
        self.catalog
            .get_or_try_init(|| async {
                self.backend
                    .ensure_catalog()
                    .await
                    .map_err(|e| SchemaError::backend("<catalog>", e))
            })
            .await?;
        Ok(())
    }

    /// Takes the namespace lock and applies every pending migration of `scope`.
    ///
    /// # Errors
    ///
    /// - [`SchemaError::LockContention`] if the lock is not acquired in time
    /// - [`SchemaError::MigrationFailed`] on the first failing version; earlier
    ///   versions of this run stay committed
    /// - [`SchemaError::ChecksumMismatch`] / [`SchemaError::OutOfOrder`] if the
    ///   ledger disagrees with the definitions
    pub async fn apply(&self, scope: Scope, namespace: &str) -> Result<MigrationOutcome> {
        let lock = NamespaceLock::acquire(
            self.backend.as_ref(),
            &lock_key(scope, namespace),
            namespace,
            self.lock,
        )
        .await?;
        let res = self.apply_locked(scope, namespace).await;
        lock.release().await;
        res
    }

    /// Same as [`apply`](Self::apply) for callers that already hold the lock.
    pub(crate) async fn apply_locked(&self, scope: Scope, namespace: &str) -> Result<MigrationOutcome> {
        self.ensure_catalog().await?;

        let applied = self.ledger(scope, namespace).await?;
        let (pending, skipped) = self.plan(scope, namespace, &applied)?;

        let mut outcome = MigrationOutcome {
            scope,
            namespace: namespace.to_owned(),
            applied: 0,
            skipped,
            applied_versions: Vec::with_capacity(pending.len()),
        };
        if pending.is_empty() {
            debug!(%scope, namespace, skipped, "Namespace is up to date");
            return Ok(outcome);
        }

        for migration in pending {
            info!(
                %scope,
                namespace,
                version = migration.version,
                description = %migration.description,
                "Applying migration"
            );
            self.apply_one(scope, namespace, migration).await?;
            outcome.applied += 1;
            outcome.applied_versions.push(migration.version);
        }

        info!(
            %scope,
            namespace,
            applied = outcome.applied,
            skipped = outcome.skipped,
            "Migration run complete"
        );
        Ok(outcome)
    }

    /// Versions that [`apply`](Self::apply) would execute, without taking the lock.
    ///
    /// # Errors
    ///
    /// Same ledger checks as [`apply`](Self::apply).
    pub async fn pending(&self, scope: Scope, namespace: &str) -> Result<Vec<u32>> {
        self.ensure_catalog().await?;
        let applied = self.ledger(scope, namespace).await?;
        let (pending, _) = self.plan(scope, namespace, &applied)?;
        Ok(pending.iter().map(|m| m.version).collect())
    }

    async fn ledger(&self, scope: Scope, namespace: &str) -> Result<Vec<LedgerEntry>> {
        self.backend
            .applied_migrations(scope, namespace)
            .await
            .map_err(|e| SchemaError::backend(namespace, e))
    }

    fn plan<'a>(
        &'a self,
        scope: Scope,
        namespace: &str,
        applied: &[LedgerEntry],
    ) -> Result<(Vec<&'a MigrationDefinition>, usize)> {
        let by_version: HashMap<u32, &LedgerEntry> = applied.iter().map(|e| (e.version, e)).collect();
        let latest_applied = applied.iter().map(|e| e.version).max();

        for entry in applied {
            match self.store.get(scope, entry.version) {
                Some(def) if def.checksum != entry.checksum => {
                    return Err(SchemaError::ChecksumMismatch {
                        namespace: namespace.to_owned(),
                        version: entry.version,
                        recorded: entry.checksum.clone(),
                        expected: def.checksum.clone(),
                    });
                }
                Some(_) => {}
                None => warn!(
                    %scope,
                    namespace,
                    version = entry.version,
                    "Ledger has a version unknown to this build"
                ),
            }
        }

        let mut pending = Vec::new();
        let mut skipped = 0;
        for migration in self.store.migrations(scope) {
            if by_version.contains_key(&migration.version) {
                skipped += 1;
                continue;
            }
            if let Some(latest) = latest_applied
                && migration.version < latest
            {
                return Err(SchemaError::OutOfOrder {
                    namespace: namespace.to_owned(),
                    version: migration.version,
                    latest_applied: latest,
                });
            }
            pending.push(migration);
        }
        Ok((pending, skipped))
    }

    async fn apply_one(&self, scope: Scope, namespace: &str, migration: &MigrationDefinition) -> Result<()> {
        let statements = u32::try_from(migration.changes.len()).unwrap_or(u32::MAX);
        let budget = self.statement_timeout.saturating_mul(statements.max(1));
        let batch = ChangeBatch {
            changes: &migration.changes,
            ledger: Some(LedgerWrite {
                scope,
                version: migration.version,
                checksum: &migration.checksum,
            }),
            statement_timeout: self.statement_timeout,
        };

        let failed = |cause: String| SchemaError::MigrationFailed {
            scope,
            namespace: namespace.to_owned(),
            version: migration.version,
            cause,
        };

        match tokio::time::timeout(budget, self.backend.apply_changes(namespace, batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.kind == BackendErrorKind::Connection => {
                warn!(namespace, version = migration.version, error = %e, "Connection lost during migration");
                Err(SchemaError::Connection(e.message))
            }
            Ok(Err(e)) => {
                warn!(namespace, version = migration.version, error = %e, "Migration failed");
                Err(failed(e.message))
            }
            Err(_) => {
                warn!(namespace, version = migration.version, ?budget, "Migration timed out");
                Err(failed(format!("timed out after {budget:?}")))
            }
        }
    }
}
