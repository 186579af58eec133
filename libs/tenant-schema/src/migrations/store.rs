use std::collections::HashSet;

use tenant_schema_sdk::Scope;
use tracing::debug;

use super::definition::{MigrationDefinition, SchemaChange};
use crate::error::{Result, SchemaError};
use crate::ident::validate_ident;
use crate::live::LiveNamespace;
use crate::registry::types::{is_safe_default, is_valid_type};
use crate::registry::{ColumnDefinition, SchemaRegistry};
use crate::validator;

/// Validated, ordered migration definitions for both scopes.
#[derive(Debug, Clone, Default)]
pub struct MigrationStore {
    shared: Vec<MigrationDefinition>,
    per_tenant: Vec<MigrationDefinition>,
}

fn inconsistent(msg: String) -> SchemaError {
    SchemaError::RegistryInconsistency(msg)
}

impl MigrationStore {
    /// Checks the definitions against each other and against the registry.
    ///
    /// Checksums that are not pinned in the source are computed here.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::RegistryInconsistency`] when versions repeat,
    /// a pinned checksum does not match, a change references a table outside
    /// the registry, or the structured changes of a scope do not converge on
    /// the registry.
    pub fn new(migrations: Vec<MigrationDefinition>, registry: &SchemaRegistry) -> Result<Self> {
        let mut store = Self::default();
        let mut seen = HashSet::new();

        for mut migration in migrations {
            if migration.version == 0 {
                return Err(inconsistent(
                    "migration versions start at 1".to_owned(),
                ));
            }
            if !seen.insert((migration.scope, migration.version)) {
                return Err(inconsistent(format!(
                    "{} migration version {} is declared more than once",
                    migration.scope, migration.version
                )));
            }
            if migration.changes.is_empty() {
                return Err(inconsistent(format!(
                    "{} migration {} has no changes",
                    migration.scope, migration.version
                )));
            }

            let computed = migration.compute_checksum()?;
            if migration.checksum.is_empty() {
                migration.checksum = computed;
            } else if !migration.checksum.eq_ignore_ascii_case(&computed) {
                return Err(inconsistent(format!(
                    "{} migration {} was edited: pinned checksum {} but content hashes to {computed}",
                    migration.scope, migration.version, migration.checksum
                )));
            }

            check_changes(&migration, registry)?;

            match migration.scope {
                Scope::Shared => store.shared.push(migration),
                Scope::PerTenant => store.per_tenant.push(migration),
            }
        }

        store.shared.sort_by_key(|m| m.version);
        store.per_tenant.sort_by_key(|m| m.version);

        for scope in [Scope::Shared, Scope::PerTenant] {
            store.check_convergence(scope, registry)?;
        }
        Ok(store)
    }

    /// Migrations of one scope, ascending by version.
    #[must_use]
    pub fn migrations(&self, scope: Scope) -> &[MigrationDefinition] {
        match scope {
            Scope::Shared => &self.shared,
            Scope::PerTenant => &self.per_tenant,
        }
    }

    #[must_use]
    pub fn get(&self, scope: Scope, version: u32) -> Option<&MigrationDefinition> {
        self.migrations(scope).iter().find(|m| m.version == version)
    }

    #[must_use]
    pub fn latest_version(&self, scope: Scope) -> Option<u32> {
        self.migrations(scope).last().map(|m| m.version)
    }

    /// Replays the structured changes of a scope onto an empty namespace and
    /// validates the result against the registry.
    fn check_convergence(&self, scope: Scope, registry: &SchemaRegistry) -> Result<()> {
        let migrations = self.migrations(scope);
        if migrations.iter().any(MigrationDefinition::has_raw_sql) {
            debug!(%scope, "Scope contains raw SQL, skipping convergence check");
            return Ok(());
        }

        let mut model = LiveNamespace::default();
        for migration in migrations {
            for change in &migration.changes {
                model.apply(change).map_err(|cause| {
                    inconsistent(format!(
                        "{scope} migration {} cannot be replayed: {cause}",
                        migration.version
                    ))
                })?;
            }
        }

        let result = validator::compare(registry, scope, "<replay>", Some(&model));
        if let Some(diff) = result.diffs.first() {
            return Err(inconsistent(format!(
                "{scope} migrations do not produce entity '{}' as declared \
                 (table missing: {}, missing columns: {:?}, missing indexes: {:?}, type mismatches: {})",
                diff.entity,
                diff.table_missing,
                diff.missing_columns,
                diff.missing_indexes,
                diff.type_mismatches.len()
            )));
        }
        Ok(())
    }
}

fn check_column(migration: &MigrationDefinition, table: &str, column: &ColumnDefinition) -> Result<()> {
    validate_ident(&column.name).map_err(|e| {
        inconsistent(format!("migration {} on '{table}': {e}", migration.version))
    })?;
    if !is_valid_type(&column.data_type) {
        return Err(inconsistent(format!(
            "migration {} declares '{table}.{}' with invalid type '{}'",
            migration.version, column.name, column.data_type
        )));
    }
    if let Some(default) = &column.default_expr
        && !is_safe_default(default)
    {
        return Err(inconsistent(format!(
            "migration {} declares an unsafe default for '{table}.{}'",
            migration.version, column.name
        )));
    }
    Ok(())
}

fn check_changes(migration: &MigrationDefinition, registry: &SchemaRegistry) -> Result<()> {
    for change in &migration.changes {
        if let Some(table) = change.table() {
            match registry.get(table) {
                Some(entity) if entity.scope == migration.scope => {}
                Some(entity) => {
                    return Err(inconsistent(format!(
                        "{} migration {} touches '{table}', which is a {} entity",
                        migration.scope, migration.version, entity.scope
                    )));
                }
                None => {
                    return Err(inconsistent(format!(
                        "{} migration {} touches '{table}', which is not in the registry",
                        migration.scope, migration.version
                    )));
                }
            }
        }
        match change {
            SchemaChange::CreateTable { table, columns } => {
                for column in columns {
                    check_column(migration, table, column)?;
                }
            }
            SchemaChange::AddColumn { table, column } => check_column(migration, table, column)?,
            SchemaChange::CreateIndex { table, index } => {
                validate_ident(&index.name).map_err(|e| {
                    inconsistent(format!("migration {} on '{table}': {e}", migration.version))
                })?;
            }
            SchemaChange::Sql(_) => {}
        }
    }

    if migration.scope == Scope::PerTenant
        && let Some(sql) = migration.unscoped_sql().next()
    {
        return Err(inconsistent(format!(
            "per-tenant migration {} has SQL without the {{{{schema}}}} placeholder: {sql}",
            migration.version
        )));
    }
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::registry::{IndexDefinition, SchemaEntityDefinition};

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(vec![
            SchemaEntityDefinition::new("tickets", Scope::PerTenant)
                .column(ColumnDefinition::new("id", "bigserial").primary_key())
                .column(ColumnDefinition::new("status", "text"))
                .index(IndexDefinition::new("idx_tickets_status", ["status"])),
            SchemaEntityDefinition::new("tenants", Scope::Shared)
                .column(ColumnDefinition::new("id", "text").primary_key()),
        ])
        .unwrap()
    }

    fn create_tickets() -> MigrationDefinition {
        MigrationDefinition::new(1, Scope::PerTenant, "tickets").change(SchemaChange::CreateTable {
            table: "tickets".to_owned(),
            columns: vec![
                ColumnDefinition::new("id", "bigserial").primary_key(),
                ColumnDefinition::new("status", "text"),
            ],
        })
    }

    fn index_tickets() -> MigrationDefinition {
        MigrationDefinition::new(2, Scope::PerTenant, "status index").change(SchemaChange::CreateIndex {
            table: "tickets".to_owned(),
            index: IndexDefinition::new("idx_tickets_status", ["status"]),
        })
    }

    fn create_tenants() -> MigrationDefinition {
        MigrationDefinition::new(1, Scope::Shared, "tenants").change(SchemaChange::CreateTable {
            table: "tenants".to_owned(),
            columns: vec![ColumnDefinition::new("id", "text").primary_key()],
        })
    }

    #[test]
    fn sorts_by_version_and_fills_checksums() {
        let store =
            MigrationStore::new(vec![index_tickets(), create_tickets(), create_tenants()], &registry())
                .unwrap();
        let versions: Vec<_> = store
            .migrations(Scope::PerTenant)
            .iter()
            .map(|m| m.version)
            .collect();
        assert_eq!(versions, [1, 2]);
        assert_eq!(store.latest_version(Scope::Shared), Some(1));
        assert!(store.get(Scope::PerTenant, 2).unwrap().checksum.len() == 64);
    }

    #[test]
    fn duplicate_versions_are_rejected() {
        let mut dup = index_tickets();
        dup.version = 1;
        let err = MigrationStore::new(vec![create_tickets(), dup, create_tenants()], &registry())
            .unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
    }

    #[test]
    fn edited_migration_is_detected_by_pinned_checksum() {
        let mut edited = index_tickets();
        edited.checksum = "00".repeat(32);
        let err = MigrationStore::new(vec![create_tickets(), edited, create_tenants()], &registry())
            .unwrap_err();
        assert!(err.to_string().contains("was edited"), "{err}");
    }

    #[test]
    fn tables_outside_registry_or_scope_are_rejected() {
        let stray = MigrationDefinition::new(3, Scope::PerTenant, "stray").change(SchemaChange::CreateTable {
            table: "orphans".to_owned(),
            columns: vec![ColumnDefinition::new("id", "bigint")],
        });
        assert!(
            MigrationStore::new(
                vec![create_tickets(), index_tickets(), stray, create_tenants()],
                &registry()
            )
            .is_err()
        );

        let wrong_scope = MigrationDefinition::new(2, Scope::Shared, "wrong").change(SchemaChange::AddColumn {
            table: "tickets".to_owned(),
            column: ColumnDefinition::new("x", "text"),
        });
        let err = MigrationStore::new(
            vec![create_tickets(), index_tickets(), create_tenants(), wrong_scope],
            &registry(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("per_tenant entity"), "{err}");
    }

    #[test]
    fn non_converging_migrations_are_rejected() {
        // Index never created.
        let err = MigrationStore::new(vec![create_tickets(), create_tenants()], &registry()).unwrap_err();
        assert!(err.to_string().contains("idx_tickets_status"), "{err}");
    }

    #[test]
    fn raw_sql_scopes_skip_convergence_but_need_placeholder() {
        let raw = MigrationDefinition::new(1, Scope::PerTenant, "raw").change(SchemaChange::Sql(
            "CREATE TABLE {{schema}}.tickets (id bigserial primary key)".to_owned(),
        ));
        assert!(MigrationStore::new(vec![raw, create_tenants()], &registry()).is_ok());

        let unscoped = MigrationDefinition::new(1, Scope::PerTenant, "raw")
            .change(SchemaChange::Sql("CREATE TABLE tickets (id bigint)".to_owned()));
        let err = MigrationStore::new(vec![unscoped, create_tenants()], &registry()).unwrap_err();
        assert!(err.to_string().contains("placeholder"), "{err}");
    }
}
