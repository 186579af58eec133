//! PostgreSQL DDL rendering.
//!
//! All statements are idempotent (`IF NOT EXISTS`) and every identifier goes
//! through [`quote_ident`](crate::ident::quote_ident).

use crate::error::{Result, SchemaError};
use crate::ident::{qualified, quote_ident, substitute_namespace};
use crate::migrations::SchemaChange;
use crate::registry::types::{is_safe_default, is_valid_type};
use crate::registry::{ColumnDefinition, IndexDefinition};

/// `CREATE SCHEMA IF NOT EXISTS "ns"`
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] for an unsafe namespace name.
pub fn create_namespace(namespace: &str) -> Result<String> {
    Ok(format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(namespace)?))
}

/// Column clause. `force_nullable` drops `NOT NULL` (used by the healer).
fn column_clause(column: &ColumnDefinition, force_nullable: bool, inline_pk: bool) -> Result<String> {
    if !is_valid_type(&column.data_type) {
        return Err(SchemaError::InvalidIdentifier {
            ident: column.data_type.clone(),
            reason: format!("not a valid type for column '{}'", column.name),
        });
    }
    let mut sql = format!("{} {}", quote_ident(&column.name)?, column.data_type.trim());
    if inline_pk && column.primary_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable && !force_nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_expr {
        if !is_safe_default(default) {
            return Err(SchemaError::InvalidIdentifier {
                ident: default.clone(),
                reason: format!("unsafe default for column '{}'", column.name),
            });
        }
        sql.push_str(" DEFAULT ");
        sql.push_str(default.trim());
    }
    Ok(sql)
}

/// `CREATE TABLE IF NOT EXISTS "ns"."table" (...)`
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] for unsafe names or types.
pub fn create_table(namespace: &str, table: &str, columns: &[ColumnDefinition]) -> Result<String> {
    let mut parts = columns
        .iter()
        .map(|c| column_clause(c, false, false))
        .collect::<Result<Vec<_>>>()?;

    let pk = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>>>()?;
    if !pk.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    }

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(namespace, table)?,
        parts.join(", ")
    ))
}

/// `ALTER TABLE "ns"."table" ADD COLUMN IF NOT EXISTS ...`
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] for unsafe names or types.
pub fn add_column(
    namespace: &str,
    table: &str,
    column: &ColumnDefinition,
    force_nullable: bool,
) -> Result<String> {
    Ok(format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
        qualified(namespace, table)?,
        column_clause(column, force_nullable, !force_nullable)?
    ))
}

/// `CREATE [UNIQUE] INDEX IF NOT EXISTS "idx" ON "ns"."table" ("a", "b")`
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] for unsafe names.
pub fn create_index(namespace: &str, table: &str, index: &IndexDefinition) -> Result<String> {
    let columns = index
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name)?,
        qualified(namespace, table)?,
        columns.join(", ")
    ))
}

/// Renders one migration or repair step.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] for unsafe names or types.
pub fn render_change(change: &SchemaChange, namespace: &str) -> Result<String> {
    match change {
        SchemaChange::CreateTable { table, columns } => create_table(namespace, table, columns),
        SchemaChange::AddColumn { table, column } => add_column(namespace, table, column, false),
        SchemaChange::CreateIndex { table, index } => create_index(namespace, table, index),
        SchemaChange::Sql(template) => substitute_namespace(template, namespace),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn create_table_quotes_everything() {
        let sql = create_table(
            "tenant_acme",
            "tickets",
            &[
                ColumnDefinition::new("id", "bigserial").primary_key(),
                ColumnDefinition::new("subject", "text").not_null(),
                ColumnDefinition::new("status", "varchar(32)")
                    .not_null()
                    .default_expr("'open'"),
            ],
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"tenant_acme\".\"tickets\" (\"id\" bigserial NOT NULL, \
             \"subject\" text NOT NULL, \"status\" varchar(32) NOT NULL DEFAULT 'open', \
             PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn add_column_can_relax_not_null() {
        let col = ColumnDefinition::new("priority", "smallint").not_null();
        assert_eq!(
            add_column("tenant_acme", "tickets", &col, false).unwrap(),
            "ALTER TABLE \"tenant_acme\".\"tickets\" ADD COLUMN IF NOT EXISTS \"priority\" smallint NOT NULL"
        );
        assert_eq!(
            add_column("tenant_acme", "tickets", &col, true).unwrap(),
            "ALTER TABLE \"tenant_acme\".\"tickets\" ADD COLUMN IF NOT EXISTS \"priority\" smallint"
        );
    }

    #[test]
    fn unique_index() {
        let idx = IndexDefinition::new("uq_tickets_number", ["number"]).unique();
        assert_eq!(
            create_index("tenant_acme", "tickets", &idx).unwrap(),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"uq_tickets_number\" ON \"tenant_acme\".\"tickets\" (\"number\")"
        );
    }

    #[test]
    fn hostile_names_never_reach_sql() {
        let col = ColumnDefinition::new("x\"; drop table t; --", "text");
        assert!(add_column("tenant_acme", "tickets", &col, false).is_err());
        assert!(create_namespace("acme; drop schema public").is_err());
        let col = ColumnDefinition::new("x", "text; drop table t");
        assert!(add_column("tenant_acme", "tickets", &col, false).is_err());
    }
}
