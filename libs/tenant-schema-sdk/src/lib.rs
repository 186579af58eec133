#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Tenant Schema SDK
//!
//! Public surface of the tenant schema engine:
//!
//! - [`TenantSchemaClient`] - the trait request handlers call before touching a tenant namespace
//! - [`ValidationResult`], [`DriftReport`], [`IndexGap`] - report models
//! - [`TenantSchemaError`] - the "not ready" signal
//!
//! ## Usage
//!
//! ```ignore
//! use tenant_schema_sdk::{TenantId, TenantSchemaClient};
//!
//! let tenant = TenantId::new("acme")?;
//! client.ensure_tenant_ready(&tenant).await?;
//! ```

pub mod api;
pub mod error;
pub mod models;

pub use api::TenantSchemaClient;
pub use error::{InvalidTenantId, TenantSchemaError};
pub use models::{
    ColumnMismatch, DriftKind, DriftReport, DriftSummary, EntityDiff, FieldDriftStat, IndexGap,
    Scope, TenantHealth, TenantId, TenantState, ValidationResult, ValidationStatus,
};
