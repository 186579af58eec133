//! Snapshot of the structure that actually exists in a namespace.

use std::collections::BTreeMap;

use crate::migrations::SchemaChange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    /// Type as reported by the catalog.
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveIndex {
    pub columns: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    pub columns: BTreeMap<String, LiveColumn>,
    pub indexes: BTreeMap<String, LiveIndex>,
}

/// Tables, columns and indexes found in one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveNamespace {
    pub tables: BTreeMap<String, LiveTable>,
}

impl LiveNamespace {
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&LiveTable> {
        self.tables.get(name)
    }

    /// Applies a structured change with `IF NOT EXISTS` semantics.
    ///
    /// Raw SQL is opaque and leaves the model untouched.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure when the change targets a missing
    /// table or indexes a missing column.
    pub fn apply(&mut self, change: &SchemaChange) -> Result<(), String> {
        match change {
            SchemaChange::CreateTable { table, columns } => {
                self.tables.entry(table.clone()).or_insert_with(|| LiveTable {
                    columns: columns
                        .iter()
                        .map(|c| {
                            (
                                c.name.clone(),
                                LiveColumn {
                                    data_type: c.data_type.clone(),
                                    nullable: c.nullable && !c.primary_key,
                                },
                            )
                        })
                        .collect(),
                    indexes: BTreeMap::new(),
                });
            }
            SchemaChange::AddColumn { table, column } => {
                let live = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| format!("relation \"{table}\" does not exist"))?;
                live.columns
                    .entry(column.name.clone())
                    .or_insert_with(|| LiveColumn {
                        data_type: column.data_type.clone(),
                        nullable: column.nullable && !column.primary_key,
                    });
            }
            SchemaChange::CreateIndex { table, index } => {
                let live = self
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| format!("relation \"{table}\" does not exist"))?;
                if let Some(missing) = index.columns.iter().find(|c| !live.columns.contains_key(*c)) {
                    return Err(format!("column \"{missing}\" does not exist"));
                }
                live.indexes
                    .entry(index.name.clone())
                    .or_insert_with(|| LiveIndex {
                        columns: index.columns.clone(),
                        unique: index.unique,
                    });
            }
            SchemaChange::Sql(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::registry::{ColumnDefinition, IndexDefinition};

    #[test]
    fn structured_changes_build_the_model() {
        let mut ns = LiveNamespace::default();
        ns.apply(&SchemaChange::CreateTable {
            table: "tickets".to_owned(),
            columns: vec![ColumnDefinition::new("id", "bigint").primary_key()],
        })
        .unwrap();
        ns.apply(&SchemaChange::AddColumn {
            table: "tickets".to_owned(),
            column: ColumnDefinition::new("status", "text"),
        })
        .unwrap();
        ns.apply(&SchemaChange::CreateIndex {
            table: "tickets".to_owned(),
            index: IndexDefinition::new("idx_status", ["status"]),
        })
        .unwrap();

        let table = ns.table("tickets").unwrap();
        assert!(!table.columns["id"].nullable);
        assert!(table.columns["status"].nullable);
        assert_eq!(table.indexes["idx_status"].columns, ["status"]);
    }

    #[test]
    fn changes_against_missing_objects_fail() {
        let mut ns = LiveNamespace::default();
        assert!(
            ns.apply(&SchemaChange::AddColumn {
                table: "nope".to_owned(),
                column: ColumnDefinition::new("x", "text"),
            })
            .is_err()
        );

        ns.apply(&SchemaChange::CreateTable {
            table: "t".to_owned(),
            columns: vec![ColumnDefinition::new("a", "text")],
        })
        .unwrap();
        let err = ns
            .apply(&SchemaChange::CreateIndex {
                table: "t".to_owned(),
                index: IndexDefinition::new("idx_b", ["b"]),
            })
            .unwrap_err();
        assert!(err.contains("\"b\""));
    }
}
