#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Multi-tenant schema lifecycle engine.
//!
//! Keeps a shared ("public") namespace and one namespace per tenant in line
//! with a canonical registry of tables, columns and indexes:
//!
//! - [`SchemaRegistry`]: what must exist, per scope
//! - [`MigrationEngine`]: ordered, checksummed, ledger-tracked migrations
//!   under a per-namespace advisory lock
//! - [`TenantNamespaceManager`]: provisioning and lifecycle state
//! - [`SchemaValidator`]: live catalog vs. registry
//! - [`AutoHealer`]: additive, non-destructive repairs
//! - [`IndexAdvisor`] and [`DriftReporter`]: read-only reporting
//! - [`SchemaLifecycle`]: the facade, also implementing
//!   [`TenantSchemaClient`](tenant_schema_sdk::TenantSchemaClient)
//!
//! # Features
//! - `pg` (default): PostgreSQL backend over `sea-orm` / `sqlx`
//! - `integration`: tests against a containerized PostgreSQL
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use tenant_schema::{InMemoryBackend, SchemaLifecycle, TenantSchemaConfig};
//! use tenant_schema_sdk::{TenantId, TenantSchemaClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TenantSchemaConfig::load(None)?;
//! let lifecycle = SchemaLifecycle::from_config(config, Arc::new(InMemoryBackend::default()))?;
//! lifecycle.setup().await?;
//! lifecycle.ensure_tenant_ready(&TenantId::new("acme")?).await?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(
    not(feature = "pg"),
    allow(unused_imports, dead_code, clippy::unused_async)
)]

pub mod advisor;
pub mod backend;
pub mod config;
pub mod ddl;
pub mod definitions;
pub mod drift;
pub mod error;
pub mod healer;
pub mod ident;
pub mod live;
pub mod migrations;
pub mod registry;
pub mod service;
pub mod tenant;
pub mod validator;

pub use advisor::IndexAdvisor;
pub use backend::{InMemoryBackend, LockSettings, SchemaBackend, TenantRecord};
#[cfg(feature = "pg")]
pub use backend::PgBackend;
pub use config::TenantSchemaConfig;
pub use definitions::SchemaDefinitions;
pub use drift::DriftReporter;
pub use error::{BackendError, BackendErrorKind, Result, SchemaError};
pub use healer::{AutoHealer, HealReport, RepairAction, RepairKind, UnsafeDiff};
pub use ident::{NamespaceNaming, quote_ident};
pub use migrations::{
    LedgerEntry, MigrationDefinition, MigrationEngine, MigrationOutcome, MigrationStore,
    SchemaChange,
};
pub use registry::{ColumnDefinition, IndexDefinition, SchemaEntityDefinition, SchemaRegistry};
pub use service::{CheckReport, SchemaLifecycle, SetupReport, Target};
pub use tenant::{ProvisionOutcome, TenantNamespaceManager};
pub use validator::SchemaValidator;
