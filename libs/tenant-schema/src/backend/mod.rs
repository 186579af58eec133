//! Storage seam of the engine.
//!
//! The engine never talks to a connection pool directly. Everything it needs
//! from the database goes through [`SchemaBackend`], so the same lifecycle
//! logic runs against PostgreSQL and against the in-memory backend used by
//! tests and dry runs.

mod lock;
pub mod memory;
#[cfg(feature = "pg")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenant_schema_sdk::{Scope, TenantId, TenantState};

use crate::error::BackendError;
use crate::live::LiveNamespace;
use crate::migrations::{LedgerEntry, SchemaChange};

pub use lock::{LockSettings, NamespaceLock};
pub use memory::InMemoryBackend;
#[cfg(feature = "pg")]
pub use postgres::PgBackend;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Ledger row written in the same transaction as a migration's changes.
#[derive(Debug, Clone, Copy)]
pub struct LedgerWrite<'a> {
    pub scope: Scope,
    pub version: u32,
    pub checksum: &'a str,
}

/// A unit of work executed atomically in one namespace.
#[derive(Debug, Clone, Copy)]
pub struct ChangeBatch<'a> {
    pub changes: &'a [SchemaChange],
    /// `None` for repairs, which leave no ledger trace.
    pub ledger: Option<LedgerWrite<'a>>,
    pub statement_timeout: Duration,
}

/// Persisted lifecycle record of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: TenantId,
    pub namespace: String,
    pub state: TenantState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A held per-namespace lock.
///
/// Dropping the value without calling [`release`](HeldLock::release) must
/// still free the lock eventually.
#[async_trait]
pub trait HeldLock: Send {
    async fn release(self: Box<Self>) -> BackendResult<()>;
}

#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Short name for logs.
    fn kind(&self) -> &'static str;

    /// Creates the public namespace, the ledger and the tenant table if absent.
    async fn ensure_catalog(&self) -> BackendResult<()>;

    async fn namespace_exists(&self, namespace: &str) -> BackendResult<bool>;

    /// Returns `true` if the namespace was created by this call.
    async fn create_namespace(&self, namespace: &str) -> BackendResult<bool>;

    /// Ledger entries of one namespace, ascending by version.
    async fn applied_migrations(
        &self,
        scope: Scope,
        namespace: &str,
    ) -> BackendResult<Vec<LedgerEntry>>;

    /// Executes the batch and its ledger row in one transaction.
    ///
    /// On any error nothing is committed.
    async fn apply_changes(&self, namespace: &str, batch: ChangeBatch<'_>) -> BackendResult<()>;

    /// Live structure of a namespace, `None` if the namespace does not exist.
    async fn describe_namespace(&self, namespace: &str) -> BackendResult<Option<LiveNamespace>>;

    /// Non-blocking lock attempt. `None` means someone else holds it.
    async fn try_lock(&self, key: &str) -> BackendResult<Option<Box<dyn HeldLock>>>;

    async fn save_tenant(&self, record: &TenantRecord) -> BackendResult<()>;

    async fn load_tenant(&self, tenant: &TenantId) -> BackendResult<Option<TenantRecord>>;

    /// All known tenants, ordered by tenant id.
    async fn list_tenants(&self) -> BackendResult<Vec<TenantRecord>>;
}
