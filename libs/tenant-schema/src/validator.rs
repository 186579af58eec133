//! Compares live namespaces against the registry.
//!
//! Validation is read-only and takes no locks. Only structure declared in the
//! registry is checked; extra tables, columns and indexes are ignored.

use std::sync::Arc;

use tenant_schema_sdk::{ColumnMismatch, EntityDiff, Scope, ValidationResult, ValidationStatus};
use tracing::debug;

use crate::backend::SchemaBackend;
use crate::error::{Result, SchemaError};
use crate::live::{LiveNamespace, LiveTable};
use crate::registry::types::same_type;
use crate::registry::{IndexDefinition, SchemaEntityDefinition, SchemaRegistry};

/// Validates namespaces through a backend.
#[derive(Clone)]
pub struct SchemaValidator {
    backend: Arc<dyn SchemaBackend>,
    registry: Arc<SchemaRegistry>,
}

impl SchemaValidator {
    pub fn new(backend: Arc<dyn SchemaBackend>, registry: Arc<SchemaRegistry>) -> Self {
        Self { backend, registry }
    }

    /// Reads the catalog of `namespace` and diffs it against the registry.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Connection`] or [`SchemaError::Backend`] if the
    /// catalog cannot be read.
    pub async fn validate(&self, scope: Scope, namespace: &str) -> Result<ValidationResult> {
        let live = self
            .backend
            .describe_namespace(namespace)
            .await
            .map_err(|e| SchemaError::backend(namespace, e))?;
        let result = compare(&self.registry, scope, namespace, live.as_ref());
        debug!(
            namespace,
            %scope,
            status = %result.status,
            drifted = result.diffs.len(),
            "Namespace validated"
        );
        Ok(result)
    }
}

/// Returns `true` if the live table has `index`, either by name or as an
/// index over exactly the same columns with at least the same uniqueness.
pub(crate) fn has_index(table: &LiveTable, index: &IndexDefinition) -> bool {
    if table.indexes.contains_key(&index.name) {
        return true;
    }
    table
        .indexes
        .values()
        .any(|live| live.columns == index.columns && (live.unique || !index.unique))
}

fn diff_entity(entity: &SchemaEntityDefinition, table: Option<&LiveTable>) -> EntityDiff {
    let Some(table) = table else {
        return EntityDiff {
            entity: entity.name.clone(),
            table_missing: true,
            missing_columns: entity.columns.iter().map(|c| c.name.clone()).collect(),
            missing_indexes: entity.indexes.iter().map(|i| i.name.clone()).collect(),
            type_mismatches: Vec::new(),
        };
    };

    let mut diff = EntityDiff {
        entity: entity.name.clone(),
        table_missing: false,
        missing_columns: Vec::new(),
        missing_indexes: Vec::new(),
        type_mismatches: Vec::new(),
    };
    for column in &entity.columns {
        match table.columns.get(&column.name) {
            None => diff.missing_columns.push(column.name.clone()),
            Some(live) if !same_type(&column.data_type, &live.data_type) => {
                diff.type_mismatches.push(ColumnMismatch {
                    column: column.name.clone(),
                    expected: column.data_type.clone(),
                    actual: live.data_type.clone(),
                });
            }
            Some(_) => {}
        }
    }
    for index in &entity.indexes {
        if !has_index(table, index) {
            diff.missing_indexes.push(index.name.clone());
        }
    }
    diff
}

/// Pure comparison of a live snapshot (`None` = namespace absent) against the registry.
#[must_use]
pub fn compare(
    registry: &SchemaRegistry,
    scope: Scope,
    namespace: &str,
    live: Option<&LiveNamespace>,
) -> ValidationResult {
    let mut expected = 0;
    let mut found = 0;
    let mut diffs = Vec::new();

    for entity in registry.all_entities(scope) {
        expected += 1;
        let table = live.and_then(|ns| ns.table(&entity.name));
        if table.is_some() {
            found += 1;
        }
        let diff = diff_entity(entity, table);
        if !diff.is_empty() {
            diffs.push(diff);
        }
    }

    let status = if live.is_none() || diffs.iter().any(|d| d.table_missing) {
        ValidationStatus::NonCompliant
    } else if diffs.is_empty() {
        ValidationStatus::Compliant
    } else {
        ValidationStatus::Partial
    };

    ValidationResult {
        scope,
        namespace: namespace.to_owned(),
        namespace_exists: live.is_some(),
        expected_entity_count: expected,
        found_entity_count: found,
        diffs,
        status,
    }
}
