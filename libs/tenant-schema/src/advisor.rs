//! Index coverage advice. Report only: nothing is ever created here.

use std::sync::Arc;

use tenant_schema_sdk::{IndexGap, Scope};
use tracing::debug;

use crate::backend::SchemaBackend;
use crate::error::{Result, SchemaError};
use crate::live::LiveNamespace;
use crate::registry::SchemaRegistry;
use crate::validator::has_index;

pub struct IndexAdvisor {
    backend: Arc<dyn SchemaBackend>,
    registry: Arc<SchemaRegistry>,
}

impl IndexAdvisor {
    pub fn new(backend: Arc<dyn SchemaBackend>, registry: Arc<SchemaRegistry>) -> Self {
        Self { backend, registry }
    }

    /// Declared indexes absent from `namespace`.
    ///
    /// # Errors
    ///
    /// Returns a connection or backend error if the catalog cannot be read.
    pub async fn analyze(&self, scope: Scope, namespace: &str) -> Result<Vec<IndexGap>> {
        let live = self
            .backend
            .describe_namespace(namespace)
            .await
            .map_err(|e| SchemaError::backend(namespace, e))?;
        let gaps = gaps(&self.registry, scope, live.as_ref());
        debug!(namespace, %scope, gaps = gaps.len(), "Index coverage analyzed");
        Ok(gaps)
    }
}

fn gaps(registry: &SchemaRegistry, scope: Scope, live: Option<&LiveNamespace>) -> Vec<IndexGap> {
    registry
        .all_entities(scope)
        .flat_map(|entity| {
            let table = live.and_then(|ns| ns.table(&entity.name));
            entity
                .indexes
                .iter()
                .filter(move |index| table.is_none_or(|t| !has_index(t, index)))
                .map(move |index| IndexGap {
                    entity: entity.name.clone(),
                    index: index.name.clone(),
                    columns: index.columns.clone(),
                    unique: index.unique,
                })
        })
        .collect()
}
