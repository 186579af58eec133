//! In-process backend.
//!
//! Keeps namespaces as [`LiveNamespace`] models, applies structured changes
//! to them and records raw SQL without interpreting it. Transactions are
//! emulated by applying a batch to a copy and swapping it in on success.
//! Faults can be injected to exercise failure paths deterministically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tenant_schema_sdk::{Scope, TenantId};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

use super::{BackendResult, ChangeBatch, HeldLock, SchemaBackend, TenantRecord};
use crate::ddl;
use crate::error::BackendError;
use crate::live::{LiveColumn, LiveIndex, LiveNamespace, LiveTable};
use crate::migrations::{LedgerEntry, SchemaChange};

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, LiveNamespace>,
    ledger: Vec<LedgerEntry>,
    next_ledger_id: i64,
    tenants: BTreeMap<TenantId, TenantRecord>,
    namespace_creations: usize,
    executed: Vec<String>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_versions: HashMap<u32, String>,
    stall_versions: HashMap<u32, Duration>,
    fail_repair_tables: HashSet<String>,
    connection_failures: usize,
}

/// Backend that keeps everything in memory.
pub struct InMemoryBackend {
    public: String,
    state: Mutex<State>,
    faults: Mutex<Faults>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

struct MemoryLock {
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl HeldLock for MemoryLock {
    async fn release(self: Box<Self>) -> BackendResult<()> {
        Ok(())
    }
}

impl InMemoryBackend {
    pub fn new(public_namespace: impl Into<String>) -> Self {
        Self {
            public: public_namespace.into(),
            state: Mutex::new(State::default()),
            faults: Mutex::new(Faults::default()),
            locks: DashMap::new(),
        }
    }

    /// Every migration with this version fails with `message`.
    pub fn fail_on_version(&self, version: u32, message: impl Into<String>) {
        self.faults.lock().fail_versions.insert(version, message.into());
    }

    /// Migrations with this version sleep before doing anything.
    pub fn stall_on_version(&self, version: u32, stall: Duration) {
        self.faults.lock().stall_versions.insert(version, stall);
    }

    /// Repairs touching `table` fail.
    pub fn fail_repairs_on(&self, table: impl Into<String>) {
        self.faults.lock().fail_repair_tables.insert(table.into());
    }

    /// The next `count` calls fail with a connection error.
    pub fn fail_connections(&self, count: usize) {
        self.faults.lock().connection_failures = count;
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    #[must_use]
    pub fn ledger_entries(&self, namespace: &str) -> Vec<LedgerEntry> {
        self.state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.namespace == namespace)
            .cloned()
            .collect()
    }

    /// How many namespaces were created through [`SchemaBackend::create_namespace`].
    #[must_use]
    pub fn namespace_creations(&self) -> usize {
        self.state.lock().namespace_creations
    }

    /// Every statement committed so far, in order.
    #[must_use]
    pub fn executed_statements(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    #[must_use]
    pub fn snapshot(&self, namespace: &str) -> Option<LiveNamespace> {
        self.state.lock().namespaces.get(namespace).cloned()
    }

    /// Simulates out-of-band `DROP TABLE`.
    pub fn drop_table(&self, namespace: &str, table: &str) -> bool {
        self.with_namespace(namespace, |ns| ns.tables.remove(table).is_some())
    }

    /// Simulates out-of-band `ALTER TABLE ... DROP COLUMN`.
    pub fn drop_column(&self, namespace: &str, table: &str, column: &str) -> bool {
        self.with_table(namespace, table, |t| {
            t.indexes.retain(|_, idx| !idx.columns.iter().any(|c| c == column));
            t.columns.remove(column).is_some()
        })
    }

    /// Simulates out-of-band `DROP INDEX`.
    pub fn drop_index(&self, namespace: &str, table: &str, index: &str) -> bool {
        self.with_table(namespace, table, |t| t.indexes.remove(index).is_some())
    }

    /// Simulates out-of-band `ALTER COLUMN ... TYPE`.
    pub fn alter_column_type(&self, namespace: &str, table: &str, column: &str, data_type: &str) -> bool {
        self.with_table(namespace, table, |t| {
            t.columns.get_mut(column).is_some_and(|c| {
                data_type.clone_into(&mut c.data_type);
                true
            })
        })
    }

    /// Simulates a table created outside the registry.
    pub fn create_extra_table(&self, namespace: &str, table: &str, columns: &[(&str, &str)]) -> bool {
        self.with_namespace(namespace, |ns| {
            ns.tables.insert(
                table.to_owned(),
                LiveTable {
                    columns: columns
                        .iter()
                        .map(|(name, ty)| {
                            (
                                (*name).to_owned(),
                                LiveColumn {
                                    data_type: (*ty).to_owned(),
                                    nullable: true,
                                },
                            )
                        })
                        .collect(),
                    indexes: BTreeMap::new(),
                },
            );
            true
        })
    }

    /// Simulates an index created outside the registry.
    pub fn create_extra_index(&self, namespace: &str, table: &str, index: &str, columns: &[&str]) -> bool {
        self.with_table(namespace, table, |t| {
            t.indexes.insert(
                index.to_owned(),
                LiveIndex {
                    columns: columns.iter().map(|c| (*c).to_owned()).collect(),
                    unique: false,
                },
            );
            true
        })
    }

    fn with_namespace(&self, namespace: &str, f: impl FnOnce(&mut LiveNamespace) -> bool) -> bool {
        self.state.lock().namespaces.get_mut(namespace).is_some_and(f)
    }

    fn with_table(&self, namespace: &str, table: &str, f: impl FnOnce(&mut LiveTable) -> bool) -> bool {
        self.with_namespace(namespace, |ns| ns.tables.get_mut(table).is_some_and(f))
    }

    fn check_connection(&self) -> BackendResult<()> {
        let mut faults = self.faults.lock();
        if faults.connection_failures > 0 {
            faults.connection_failures -= 1;
            return Err(BackendError::connection("connection refused (injected)"));
        }
        Ok(())
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("public")
    }
}

#[async_trait]
impl SchemaBackend for InMemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ensure_catalog(&self) -> BackendResult<()> {
        self.check_connection()?;
        self.state
            .lock()
            .namespaces
            .entry(self.public.clone())
            .or_default();
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> BackendResult<bool> {
        self.check_connection()?;
        Ok(self.state.lock().namespaces.contains_key(namespace))
    }

    async fn create_namespace(&self, namespace: &str) -> BackendResult<bool> {
        self.check_connection()?;
        let sql = ddl::create_namespace(namespace).map_err(|e| BackendError::statement(e.to_string()))?;
        let mut state = self.state.lock();
        if state.namespaces.contains_key(namespace) {
            return Ok(false);
        }
        state.namespaces.insert(namespace.to_owned(), LiveNamespace::default());
        state.namespace_creations += 1;
        state.executed.push(sql);
        Ok(true)
    }

    async fn applied_migrations(&self, scope: Scope, namespace: &str) -> BackendResult<Vec<LedgerEntry>> {
        self.check_connection()?;
        let mut entries: Vec<_> = self
            .state
            .lock()
            .ledger
            .iter()
            .filter(|e| e.scope == scope && e.namespace == namespace)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.version);
        Ok(entries)
    }

    async fn apply_changes(&self, namespace: &str, batch: ChangeBatch<'_>) -> BackendResult<()> {
        self.check_connection()?;

        let (stall, failure, repair_failure) = {
            let faults = self.faults.lock();
            match batch.ledger {
                Some(ledger) => (
                    faults.stall_versions.get(&ledger.version).copied(),
                    faults.fail_versions.get(&ledger.version).cloned(),
                    None,
                ),
                None => (
                    None,
                    None,
                    batch
                        .changes
                        .iter()
                        .filter_map(SchemaChange::table)
                        .find(|t| faults.fail_repair_tables.contains(*t))
                        .map(str::to_owned),
                ),
            }
        };
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        if let Some(message) = failure {
            return Err(BackendError::statement(message));
        }
        if let Some(table) = repair_failure {
            return Err(BackendError::statement(format!(
                "permission denied for table {table} (injected)"
            )));
        }

        let statements = batch
            .changes
            .iter()
            .map(|c| c.render(namespace))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BackendError::statement(e.to_string()))?;

        let mut state = self.state.lock();
        let mut model = state
            .namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| BackendError::statement(format!("schema \"{namespace}\" does not exist")))?;
        for change in batch.changes {
            model.apply(change).map_err(BackendError::statement)?;
        }

        if let Some(ledger) = batch.ledger {
            let duplicate = state
                .ledger
                .iter()
                .any(|e| e.scope == ledger.scope && e.namespace == namespace && e.version == ledger.version);
            if duplicate {
                return Err(BackendError::conflict(format!(
                    "duplicate key value violates unique constraint: ({}, {namespace}, {})",
                    ledger.scope, ledger.version
                )));
            }
            state.next_ledger_id += 1;
            let entry = LedgerEntry {
                id: state.next_ledger_id,
                scope: ledger.scope,
                namespace: namespace.to_owned(),
                version: ledger.version,
                checksum: ledger.checksum.to_owned(),
                executed_at: Utc::now(),
            };
            state.ledger.push(entry);
        }

        trace!(namespace, statements = statements.len(), "Committed batch");
        state.namespaces.insert(namespace.to_owned(), model);
        state.executed.extend(statements);
        Ok(())
    }

    async fn describe_namespace(&self, namespace: &str) -> BackendResult<Option<LiveNamespace>> {
        self.check_connection()?;
        Ok(self.state.lock().namespaces.get(namespace).cloned())
    }

    async fn try_lock(&self, key: &str) -> BackendResult<Option<Box<dyn HeldLock>>> {
        self.check_connection()?;
        let mutex = self
            .locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        Ok(mutex
            .try_lock_owned()
            .ok()
            .map(|guard| Box::new(MemoryLock { _guard: guard }) as Box<dyn HeldLock>))
    }

    async fn save_tenant(&self, record: &TenantRecord) -> BackendResult<()> {
        self.check_connection()?;
        self.state
            .lock()
            .tenants
            .insert(record.tenant_id.clone(), record.clone());
        Ok(())
    }

    async fn load_tenant(&self, tenant: &TenantId) -> BackendResult<Option<TenantRecord>> {
        self.check_connection()?;
        Ok(self.state.lock().tenants.get(tenant).cloned())
    }

    async fn list_tenants(&self) -> BackendResult<Vec<TenantRecord>> {
        self.check_connection()?;
        Ok(self.state.lock().tenants.values().cloned().collect())
    }
}
