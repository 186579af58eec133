//! Non-destructive repair of drifted namespaces.
//!
//! The healer only ever adds: a missing namespace, missing tables (with their
//! indexes), missing columns and missing indexes. It never drops, renames or
//! retypes anything and never touches data. Each entity is repaired in its
//! own transaction so one failing table does not block the others.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tenant_schema_sdk::{EntityDiff, Scope, ValidationResult};
use tracing::{info, warn};

use crate::backend::{ChangeBatch, LockSettings, NamespaceLock, SchemaBackend};
use crate::error::{Result, SchemaError};
use crate::ident::lock_key;
use crate::migrations::SchemaChange;
use crate::registry::{SchemaEntityDefinition, SchemaRegistry};
use crate::validator::SchemaValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairKind {
    CreateNamespace,
    CreateTable,
    AddColumn,
    CreateIndex,
}

/// One repair the healer attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairAction {
    pub entity: String,
    pub kind: RepairKind,
    /// Namespace, table, column or index name.
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Set when the repair failed; the rest of the entity's batch rolled back with it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RepairAction {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Drift the healer refused to touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnsafeDiff {
    pub entity: String,
    pub detail: String,
}

/// Outcome of a healing pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealReport {
    pub scope: Scope,
    pub namespace: String,
    pub actions: Vec<RepairAction>,
    pub unsafe_diffs: Vec<UnsafeDiff>,
    /// Validation re-run after all repairs.
    pub after: ValidationResult,
}

impl HealReport {
    #[must_use]
    pub fn is_healed(&self) -> bool {
        self.after.is_compliant()
    }

    pub fn failed_actions(&self) -> impl Iterator<Item = &RepairAction> {
        self.actions.iter().filter(|a| !a.succeeded())
    }

    /// Refused drift as typed errors.
    #[must_use]
    pub fn unsafe_errors(&self) -> Vec<SchemaError> {
        self.unsafe_diffs
            .iter()
            .map(|d| SchemaError::HealingUnsafe {
                namespace: self.namespace.clone(),
                entity: d.entity.clone(),
                detail: d.detail.clone(),
            })
            .collect()
    }
}

/// Repairs drift reported by the validator.
pub struct AutoHealer {
    backend: Arc<dyn SchemaBackend>,
    registry: Arc<SchemaRegistry>,
    validator: SchemaValidator,
    lock: LockSettings,
    statement_timeout: Duration,
    enabled: bool,
}

/// Repairs planned for one entity.
struct EntityPlan {
    changes: Vec<SchemaChange>,
    actions: Vec<RepairAction>,
}

impl AutoHealer {
    pub fn new(
        backend: Arc<dyn SchemaBackend>,
        registry: Arc<SchemaRegistry>,
        lock: LockSettings,
        statement_timeout: Duration,
        enabled: bool,
    ) -> Self {
        let validator = SchemaValidator::new(backend.clone(), registry.clone());
        Self {
            backend,
            registry,
            validator,
            lock,
            statement_timeout,
            enabled,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Repairs the drift in `result` and re-validates.
    ///
    /// The namespace is re-validated under the lock before planning, so a
    /// stale `result` never causes a wrong repair. Failures of individual
    /// entities are reported in [`HealReport::actions`], not raised.
    ///
    /// # Errors
    ///
    /// - [`SchemaError::HealingDisabled`] in validation-only mode
    /// - [`SchemaError::LockContention`] if the namespace lock is busy
    /// - connection and backend errors from validation
    pub async fn heal(&self, result: &ValidationResult) -> Result<HealReport> {
        let namespace = result.namespace.as_str();
        if !self.enabled {
            return Err(SchemaError::HealingDisabled {
                namespace: namespace.to_owned(),
            });
        }
        if result.is_compliant() {
            return Ok(HealReport {
                scope: result.scope,
                namespace: namespace.to_owned(),
                actions: Vec::new(),
                unsafe_diffs: Vec::new(),
                after: result.clone(),
            });
        }

        let lock = NamespaceLock::acquire(
            self.backend.as_ref(),
            &lock_key(result.scope, namespace),
            namespace,
            self.lock,
        )
        .await?;
        let res = self.heal_locked(result.scope, namespace).await;
        lock.release().await;
        res
    }

    async fn heal_locked(&self, scope: Scope, namespace: &str) -> Result<HealReport> {
        let current = self.validator.validate(scope, namespace).await?;
        let mut actions = Vec::new();
        let mut unsafe_diffs = Vec::new();

        if !current.namespace_exists {
            let mut action = RepairAction {
                entity: String::new(),
                kind: RepairKind::CreateNamespace,
                target: namespace.to_owned(),
                note: None,
                error: None,
            };
            if let Err(e) = self.backend.create_namespace(namespace).await {
                warn!(namespace, error = %e, "Could not create namespace");
                action.error = Some(e.message);
                actions.push(action);
                let after = self.validator.validate(scope, namespace).await?;
                return Ok(HealReport {
                    scope,
                    namespace: namespace.to_owned(),
                    actions,
                    unsafe_diffs,
                    after,
                });
            }
            actions.push(action);
        }

        for diff in &current.diffs {
            let entity = self.registry.require(&diff.entity)?;
            let plan = plan_entity(entity, diff, &mut unsafe_diffs);
            if plan.changes.is_empty() {
                continue;
            }
            actions.extend(self.execute(namespace, entity, plan).await);
        }

        let after = self.validator.validate(scope, namespace).await?;
        info!(
            namespace,
            %scope,
            repairs = actions.len(),
            refused = unsafe_diffs.len(),
            status = %after.status,
            "Healing pass finished"
        );
        Ok(HealReport {
            scope,
            namespace: namespace.to_owned(),
            actions,
            unsafe_diffs,
            after,
        })
    }

    async fn execute(&self, namespace: &str, entity: &SchemaEntityDefinition, plan: EntityPlan) -> Vec<RepairAction> {
        let EntityPlan { changes, mut actions } = plan;
        let statements = u32::try_from(changes.len()).unwrap_or(u32::MAX);
        let budget = self.statement_timeout.saturating_mul(statements.max(1));
        let batch = ChangeBatch {
            changes: &changes,
            ledger: None,
            statement_timeout: self.statement_timeout,
        };

        let error = match tokio::time::timeout(budget, self.backend.apply_changes(namespace, batch)).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.message),
            Err(_) => Some(format!("timed out after {budget:?}")),
        };
        if let Some(error) = error {
            warn!(namespace, entity = %entity.name, %error, "Repair failed");
            for action in &mut actions {
                action.error = Some(error.clone());
            }
        }
        actions
    }
}

fn action(entity: &str, kind: RepairKind, target: &str) -> RepairAction {
    RepairAction {
        entity: entity.to_owned(),
        kind,
        target: target.to_owned(),
        note: None,
        error: None,
    }
}

fn plan_entity(entity: &SchemaEntityDefinition, diff: &EntityDiff, unsafe_diffs: &mut Vec<UnsafeDiff>) -> EntityPlan {
    let name = entity.name.as_str();
    let mut plan = EntityPlan {
        changes: Vec::new(),
        actions: Vec::new(),
    };

    if diff.table_missing {
        plan.changes.push(SchemaChange::CreateTable {
            table: entity.name.clone(),
            columns: entity.columns.clone(),
        });
        plan.actions.push(action(name, RepairKind::CreateTable, name));
        for index in &entity.indexes {
            plan.changes.push(SchemaChange::CreateIndex {
                table: entity.name.clone(),
                index: index.clone(),
            });
            plan.actions.push(action(name, RepairKind::CreateIndex, &index.name));
        }
        return plan;
    }

    for mismatch in &diff.type_mismatches {
        unsafe_diffs.push(UnsafeDiff {
            entity: entity.name.clone(),
            detail: format!(
                "column '{}' is {} but should be {}; changing a column type is not a safe repair",
                mismatch.column, mismatch.actual, mismatch.expected
            ),
        });
    }

    let mut added = Vec::new();
    for column_name in &diff.missing_columns {
        let Some(column) = entity.find_column(column_name) else {
            continue;
        };
        if column.primary_key {
            unsafe_diffs.push(UnsafeDiff {
                entity: entity.name.clone(),
                detail: format!("primary key column '{column_name}' cannot be added to an existing table"),
            });
            continue;
        }
        let mut column = column.clone();
        let mut act = action(name, RepairKind::AddColumn, column_name);
        if !column.nullable && column.default_expr.is_none() {
            column.nullable = true;
            act.note = Some("added as nullable: NOT NULL without a default would fail on existing rows".to_owned());
        }
        plan.changes.push(SchemaChange::AddColumn {
            table: entity.name.clone(),
            column,
        });
        plan.actions.push(act);
        added.push(column_name.as_str());
    }

    for index_name in &diff.missing_indexes {
        let Some(index) = entity.find_index(index_name) else {
            continue;
        };
        // An index over a column that could not be added would fail the whole batch.
        let blocked = index
            .columns
            .iter()
            .find(|c| diff.missing_columns.contains(c) && !added.contains(&c.as_str()));
        if let Some(column) = blocked {
            unsafe_diffs.push(UnsafeDiff {
                entity: entity.name.clone(),
                detail: format!("index '{index_name}' needs column '{column}', which was not repaired"),
            });
            continue;
        }
        plan.changes.push(SchemaChange::CreateIndex {
            table: entity.name.clone(),
            index: index.clone(),
        });
        plan.actions.push(action(name, RepairKind::CreateIndex, index_name));
    }

    plan
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use tenant_schema_sdk::ColumnMismatch;

    use super::*;
    use crate::registry::{ColumnDefinition, IndexDefinition};

    fn tickets() -> SchemaEntityDefinition {
        SchemaEntityDefinition::new("tickets", Scope::PerTenant)
            .column(ColumnDefinition::new("id", "bigserial").primary_key())
            .column(ColumnDefinition::new("priority", "smallint").not_null())
            .column(ColumnDefinition::new("status", "text").not_null().default_expr("'open'"))
            .index(IndexDefinition::new("idx_tickets_priority", ["priority"]))
    }

    fn diff() -> EntityDiff {
        EntityDiff {
            entity: "tickets".to_owned(),
            table_missing: false,
            missing_columns: vec!["priority".to_owned(), "status".to_owned()],
            missing_indexes: vec!["idx_tickets_priority".to_owned()],
            type_mismatches: vec![],
        }
    }

    #[test]
    fn not_null_without_default_is_relaxed() {
        let mut refused = Vec::new();
        let plan = plan_entity(&tickets(), &diff(), &mut refused);
        assert!(refused.is_empty());
        assert_eq!(plan.changes.len(), 3);

        let SchemaChange::AddColumn { column, .. } = &plan.changes[0] else {
            panic!("expected add_column");
        };
        assert!(column.nullable);
        assert!(plan.actions[0].note.is_some());

        let SchemaChange::AddColumn { column, .. } = &plan.changes[1] else {
            panic!("expected add_column");
        };
        assert!(!column.nullable, "columns with a default keep NOT NULL");
        assert!(plan.actions[1].note.is_none());
        assert_eq!(plan.actions[2].kind, RepairKind::CreateIndex);
    }

    #[test]
    fn type_mismatch_and_primary_key_are_refused() {
        let mut d = diff();
        d.missing_columns = vec!["id".to_owned()];
        d.missing_indexes.clear();
        d.type_mismatches = vec![ColumnMismatch {
            column: "priority".to_owned(),
            expected: "smallint".to_owned(),
            actual: "text".to_owned(),
        }];
        let mut refused = Vec::new();
        let plan = plan_entity(&tickets(), &d, &mut refused);
        assert!(plan.changes.is_empty());
        assert_eq!(refused.len(), 2);
        assert!(refused[0].detail.contains("not a safe repair"));
    }

    #[test]
    fn missing_table_is_created_with_indexes() {
        let d = EntityDiff {
            entity: "tickets".to_owned(),
            table_missing: true,
            missing_columns: vec![],
            missing_indexes: vec![],
            type_mismatches: vec![],
        };
        let mut refused = Vec::new();
        let plan = plan_entity(&tickets(), &d, &mut refused);
        let kinds: Vec<_> = plan.actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, [RepairKind::CreateTable, RepairKind::CreateIndex]);
    }
}
