//! Versioned migrations: definitions, the validated store and the engine that
//! applies them under the ledger.

mod definition;
mod engine;
mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenant_schema_sdk::Scope;

pub use definition::{MigrationDefinition, SchemaChange};
pub use engine::{MigrationEngine, MigrationOutcome};
pub use store::MigrationStore;

/// Record of one migration applied to one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub scope: Scope,
    pub namespace: String,
    pub version: u32,
    pub checksum: String,
    pub executed_at: DateTime<Utc>,
}
