//! Canonical schema registry.
//!
//! The registry is the single source of truth for which tables, columns and
//! indexes must exist in the shared namespace and in every tenant namespace.
//! It is built once at startup and never mutated afterwards.

mod model;
pub mod types;

use std::collections::{HashMap, HashSet};

use tenant_schema_sdk::Scope;

use crate::error::{Result, SchemaError};
use crate::ident::validate_ident;

pub use model::{ColumnDefinition, IndexDefinition, SchemaEntityDefinition};

/// Immutable set of entity definitions.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: Vec<SchemaEntityDefinition>,
    by_name: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// Builds the registry, rejecting anything that could not exist in a database.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::RegistryInconsistency`] on duplicate entity,
    /// column or index names, indexes over undeclared columns, invalid
    /// identifiers, invalid column types and unsafe default expressions.
    pub fn new(entities: Vec<SchemaEntityDefinition>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(entities.len());
        // Index names share the namespace with tables in PostgreSQL.
        let mut relation_names: HashMap<Scope, HashSet<&str>> = HashMap::new();

        for (pos, entity) in entities.iter().enumerate() {
            check_entity(entity)?;
            if by_name.insert(entity.name.clone(), pos).is_some() {
                return Err(inconsistent(format!(
                    "entity '{}' is declared more than once",
                    entity.name
                )));
            }
            let names = relation_names.entry(entity.scope).or_default();
            if !names.insert(entity.name.as_str()) {
                return Err(inconsistent(format!(
                    "entity '{}' collides with an index of the same name",
                    entity.name
                )));
            }
            for index in &entity.indexes {
                if !names.insert(index.name.as_str()) {
                    return Err(inconsistent(format!(
                        "index '{}' on '{}' collides with another relation in the {} scope",
                        index.name, entity.name, entity.scope
                    )));
                }
            }
        }

        Ok(Self { entities, by_name })
    }

    /// Looks up an entity by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SchemaEntityDefinition> {
        self.by_name.get(name).map(|&pos| &self.entities[pos])
    }

    /// Like [`get`](Self::get), but a missing entity is an error.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::RegistryInconsistency`] if `name` is not declared.
    pub fn require(&self, name: &str) -> Result<&SchemaEntityDefinition> {
        self.get(name)
            .ok_or_else(|| inconsistent(format!("entity '{name}' is not declared")))
    }

    /// Entities of one scope, in declaration order.
    pub fn all_entities(&self, scope: Scope) -> impl Iterator<Item = &SchemaEntityDefinition> {
        self.entities.iter().filter(move |e| e.scope == scope)
    }

    /// Number of entities in one scope.
    #[must_use]
    pub fn count(&self, scope: Scope) -> usize {
        self.all_entities(scope).count()
    }

    #[must_use]
    pub fn entities(&self) -> &[SchemaEntityDefinition] {
        &self.entities
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn inconsistent(msg: String) -> SchemaError {
    SchemaError::RegistryInconsistency(msg)
}

fn ident_in(entity: &str, what: &str, name: &str) -> Result<()> {
    validate_ident(name).map_err(|e| inconsistent(format!("{what} in entity '{entity}': {e}")))
}

fn check_entity(entity: &SchemaEntityDefinition) -> Result<()> {
    let name = entity.name.as_str();
    ident_in(name, "table name", name)?;

    if entity.columns.is_empty() {
        return Err(inconsistent(format!("entity '{name}' declares no columns")));
    }

    let mut columns = HashSet::new();
    for column in &entity.columns {
        ident_in(name, "column name", &column.name)?;
        if !columns.insert(column.name.as_str()) {
            return Err(inconsistent(format!(
                "column '{}' is declared twice in entity '{name}'",
                column.name
            )));
        }
        if !types::is_valid_type(&column.data_type) {
            return Err(inconsistent(format!(
                "column '{name}.{}' has invalid type '{}'",
                column.name, column.data_type
            )));
        }
        if let Some(default) = &column.default_expr
            && !types::is_safe_default(default)
        {
            return Err(inconsistent(format!(
                "column '{name}.{}' has an unsafe default expression",
                column.name
            )));
        }
    }

    let mut indexes = HashSet::new();
    for index in &entity.indexes {
        ident_in(name, "index name", &index.name)?;
        if !indexes.insert(index.name.as_str()) {
            return Err(inconsistent(format!(
                "index '{}' is declared twice in entity '{name}'",
                index.name
            )));
        }
        if index.columns.is_empty() {
            return Err(inconsistent(format!(
                "index '{}' in entity '{name}' lists no columns",
                index.name
            )));
        }
        if let Some(missing) = index.columns.iter().find(|c| !columns.contains(c.as_str())) {
            return Err(inconsistent(format!(
                "index '{}' in entity '{name}' references undeclared column '{missing}'",
                index.name
            )));
        }
    }

    Ok(())
}
