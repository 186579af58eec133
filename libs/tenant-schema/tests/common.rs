#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tenant_schema::{
    ColumnDefinition, InMemoryBackend, MigrationDefinition, MigrationStore, SchemaChange,
    SchemaDefinitions, SchemaEntityDefinition, SchemaLifecycle, SchemaRegistry,
    TenantSchemaConfig,
};
use tenant_schema_sdk::{Scope, TenantId};

/// Config with short timeouts so failure paths finish quickly.
#[must_use]
pub fn fast_config() -> TenantSchemaConfig {
    let mut cfg = TenantSchemaConfig {
        lock_timeout: Duration::from_secs(5),
        lock_initial_backoff: Duration::from_millis(5),
        statement_timeout: Duration::from_secs(5),
        ..TenantSchemaConfig::default()
    };
    cfg.retry.initial_backoff = Duration::from_millis(5);
    cfg.retry.max_backoff = Duration::from_millis(20);
    cfg
}

#[must_use]
pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

/// Built-in helpdesk definitions over a fresh in-memory backend.
#[must_use]
pub fn helpdesk(config: TenantSchemaConfig) -> (Arc<InMemoryBackend>, Arc<SchemaLifecycle>) {
    let backend = Arc::new(InMemoryBackend::new(config.public_namespace.clone()));
    let (registry, store) = SchemaDefinitions::builtin().unwrap().build().unwrap();
    let lifecycle = SchemaLifecycle::new(backend.clone(), registry, store, config).unwrap();
    (backend, Arc::new(lifecycle))
}

/// One per-tenant table grown by eight migrations: `v1` creates `events`,
/// `v2..=v8` each add column `c<version>`.
#[must_use]
pub fn eight_step_definitions() -> (SchemaRegistry, MigrationStore) {
    let mut events = SchemaEntityDefinition::new("events", Scope::PerTenant)
        .column(ColumnDefinition::new("id", "bigserial").primary_key());
    for version in 2..=8 {
        events = events.column(ColumnDefinition::new(format!("c{version}"), "text"));
    }
    let registry = SchemaRegistry::new(vec![events]).unwrap();

    let mut migrations = vec![
        MigrationDefinition::new(1, Scope::PerTenant, "events").change(SchemaChange::CreateTable {
            table: "events".to_owned(),
            columns: vec![ColumnDefinition::new("id", "bigserial").primary_key()],
        }),
    ];
    for version in 2..=8 {
        migrations.push(
            MigrationDefinition::new(version, Scope::PerTenant, format!("column c{version}")).change(
                SchemaChange::AddColumn {
                    table: "events".to_owned(),
                    column: ColumnDefinition::new(format!("c{version}"), "text"),
                },
            ),
        );
    }
    let store = MigrationStore::new(migrations, &registry).unwrap();
    (registry, store)
}

#[must_use]
pub fn eight_steps(config: TenantSchemaConfig) -> (Arc<InMemoryBackend>, Arc<SchemaLifecycle>) {
    let backend = Arc::new(InMemoryBackend::new(config.public_namespace.clone()));
    let (registry, store) = eight_step_definitions();
    let lifecycle = SchemaLifecycle::new(backend.clone(), registry, store, config).unwrap();
    (backend, Arc::new(lifecycle))
}

#[must_use]
pub fn versions(backend: &InMemoryBackend, namespace: &str) -> Vec<u32> {
    backend
        .ledger_entries(namespace)
        .iter()
        .map(|e| e.version)
        .collect()
}
