use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tenant_schema_sdk::Scope;

use crate::ddl;
use crate::error::{Result, SchemaError};
use crate::ident::NAMESPACE_PLACEHOLDER;
use crate::registry::{ColumnDefinition, IndexDefinition};

/// One step of a migration.
///
/// Structured changes are understood by the engine (and replayed by the
/// convergence check); `sql` is an opaque template executed verbatim after
/// `{{schema}}` substitution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum SchemaChange {
    CreateTable {
        table: String,
        columns: Vec<ColumnDefinition>,
    },
    AddColumn {
        table: String,
        column: ColumnDefinition,
    },
    CreateIndex {
        table: String,
        index: IndexDefinition,
    },
    Sql(String),
}

impl SchemaChange {
    /// Table touched by a structured change.
    #[must_use]
    pub fn table(&self) -> Option<&str> {
        match self {
            Self::CreateTable { table, .. }
            | Self::AddColumn { table, .. }
            | Self::CreateIndex { table, .. } => Some(table),
            Self::Sql(_) => None,
        }
    }

    #[must_use]
    pub fn is_raw_sql(&self) -> bool {
        matches!(self, Self::Sql(_))
    }

    /// Renders the change for `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidIdentifier`] if any name cannot be quoted.
    pub fn render(&self, namespace: &str) -> Result<String> {
        ddl::render_change(self, namespace)
    }
}

/// A versioned, immutable schema change for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationDefinition {
    pub version: u32,
    pub scope: Scope,
    #[serde(default)]
    pub description: String,
    pub changes: Vec<SchemaChange>,
    /// SHA-256 of the version, scope and changes. Filled in by the store when
    /// the definition file does not pin it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
}

#[derive(Serialize)]
struct ChecksumInput<'a> {
    version: u32,
    scope: Scope,
    changes: &'a [SchemaChange],
}

impl MigrationDefinition {
    pub fn new(version: u32, scope: Scope, description: impl Into<String>) -> Self {
        Self {
            version,
            scope,
            description: description.into(),
            changes: Vec::new(),
            checksum: String::new(),
        }
    }

    #[must_use]
    pub fn change(mut self, change: SchemaChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Content hash of this migration. The description is not part of it.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::RegistryInconsistency`] if the changes cannot be serialized.
    pub fn compute_checksum(&self) -> Result<String> {
        let payload = serde_json::to_vec(&ChecksumInput {
            version: self.version,
            scope: self.scope,
            changes: &self.changes,
        })
        .map_err(|e| {
            SchemaError::RegistryInconsistency(format!(
                "migration {} cannot be serialized: {e}",
                self.version
            ))
        })?;
        Ok(hex::encode(Sha256::digest(&payload)))
    }

    /// Statements to execute, in order, for `namespace`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidIdentifier`] if any name cannot be quoted.
    pub fn statements(&self, namespace: &str) -> Result<Vec<String>> {
        self.changes.iter().map(|c| c.render(namespace)).collect()
    }

    #[must_use]
    pub fn has_raw_sql(&self) -> bool {
        self.changes.iter().any(SchemaChange::is_raw_sql)
    }

    /// Raw SQL templates lacking the namespace placeholder.
    pub(crate) fn unscoped_sql(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| match c {
            SchemaChange::Sql(sql) if !sql.contains(NAMESPACE_PLACEHOLDER) => Some(sql.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn sample() -> MigrationDefinition {
        MigrationDefinition::new(1, Scope::PerTenant, "tickets").change(SchemaChange::CreateTable {
            table: "tickets".to_owned(),
            columns: vec![ColumnDefinition::new("id", "bigserial").primary_key()],
        })
    }

    #[test]
    fn checksum_ignores_description_but_not_changes() {
        let a = sample();
        let mut b = sample();
        b.description = "reworded".to_owned();
        assert_eq!(a.compute_checksum().unwrap(), b.compute_checksum().unwrap());

        let c = sample().change(SchemaChange::Sql("SELECT 1".to_owned()));
        assert_ne!(a.compute_checksum().unwrap(), c.compute_checksum().unwrap());
        assert_eq!(a.compute_checksum().unwrap().len(), 64);
    }

    #[test]
    fn yaml_changes_are_externally_tagged() {
        let yaml = r#"
version: 2
scope: per_tenant
description: priority
changes:
  - add_column:
      table: tickets
      column: { name: priority, type: smallint, nullable: false, default: "0" }
  - create_index:
      table: tickets
      index: { name: idx_tickets_priority, columns: [priority] }
  - sql: "UPDATE {{schema}}.tickets SET priority = 1"
"#;
        let m: MigrationDefinition = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(m.changes.len(), 3);
        assert!(m.has_raw_sql());
        assert_eq!(m.unscoped_sql().count(), 0);
        assert_eq!(m.changes[0].table(), Some("tickets"));

        let stmts = m.statements("tenant_acme").unwrap();
        assert_eq!(stmts[2], "UPDATE \"tenant_acme\".tickets SET priority = 1");
    }
}
