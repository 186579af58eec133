//! Loading of entity and migration definitions from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SchemaError};
use crate::migrations::{MigrationDefinition, MigrationStore};
use crate::registry::{SchemaEntityDefinition, SchemaRegistry};

/// Definition set shipped with the library.
pub const BUILTIN_DEFINITIONS: &str = include_str!("../definitions/helpdesk.yaml");

/// Raw, not yet validated definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDefinitions {
    #[serde(default)]
    pub entities: Vec<SchemaEntityDefinition>,
    #[serde(default)]
    pub migrations: Vec<MigrationDefinition>,
}

impl SchemaDefinitions {
    /// # Errors
    ///
    /// Returns [`SchemaError::Config`] if the YAML does not parse.
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_saphyr::from_str(source)
            .map_err(|e| SchemaError::Config(format!("invalid schema definitions: {e}")))
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::Config`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            SchemaError::Config(format!("cannot read definitions '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&source)
    }

    /// The built-in helpdesk definitions.
    ///
    /// # Errors
    ///
    /// Only fails if the embedded file is broken.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_DEFINITIONS)
    }

    /// `path` if given, the built-in set otherwise.
    ///
    /// # Errors
    ///
    /// See [`from_path`](Self::from_path).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!(path = %path.display(), "Loading schema definitions");
                Self::from_path(path)
            }
            None => Self::builtin(),
        }
    }

    /// Validates everything and builds the registry and the migration store.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::RegistryInconsistency`] on any inconsistency.
    pub fn build(self) -> Result<(SchemaRegistry, MigrationStore)> {
        let registry = SchemaRegistry::new(self.entities)?;
        let store = MigrationStore::new(self.migrations, &registry)?;
        Ok((registry, store))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use tenant_schema_sdk::Scope;

    use super::*;

    #[test]
    fn builtin_definitions_are_consistent() {
        let (registry, store) = SchemaDefinitions::builtin().unwrap().build().unwrap();
        assert_eq!(registry.count(Scope::Shared), 2);
        assert_eq!(registry.count(Scope::PerTenant), 4);
        assert_eq!(store.latest_version(Scope::PerTenant), Some(6));
        assert_eq!(store.latest_version(Scope::Shared), Some(3));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SchemaDefinitions::from_yaml("entitys: []").unwrap_err();
        assert!(matches!(err, SchemaError::Config(_)));
    }
}
