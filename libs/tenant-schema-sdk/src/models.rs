//! Domain models shared between the schema engine and its consumers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidTenantId;

/// Upper bound for tenant identifiers accepted by the engine.
pub const TENANT_ID_MAX_LEN: usize = 128;

/// Opaque tenant identifier.
///
/// Any printable string is accepted; the engine derives a safe namespace
/// name from it and never interpolates it into SQL directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTenantId`] when the value is empty, longer than
    /// [`TENANT_ID_MAX_LEN`] bytes, or contains control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(InvalidTenantId::Empty);
        }
        if value.len() > TENANT_ID_MAX_LEN {
            return Err(InvalidTenantId::TooLong { len: value.len() });
        }
        if value.chars().any(char::is_control) {
            return Err(InvalidTenantId::ControlCharacter);
        }
        Ok(Self(value))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Where a schema entity or migration lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Exists once, in the public namespace.
    Shared,
    /// Replicated into every tenant namespace.
    PerTenant,
}

impl Scope {
    /// Stable textual form, used as the ledger `scope` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::PerTenant => "per_tenant",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "per_tenant" => Ok(Self::PerTenant),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

/// Lifecycle state of a tenant namespace.
///
/// ```text
/// absent -> provisioning -> migrating -> ready <-> degraded
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    /// No namespace has been provisioned yet.
    #[default]
    Absent,
    /// Namespace creation in progress.
    Provisioning,
    /// Migrations are being applied.
    Migrating,
    /// Namespace is at the current version and validated.
    Ready,
    /// Migration failed or uncorrectable drift was detected.
    Degraded,
}

impl TenantState {
    /// Stable textual form, used for persistence.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Provisioning => "provisioning",
            Self::Migrating => "migrating",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
        }
    }
}

impl fmt::Display for TenantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "absent" => Ok(Self::Absent),
            "provisioning" => Ok(Self::Provisioning),
            "migrating" => Ok(Self::Migrating),
            "ready" => Ok(Self::Ready),
            "degraded" => Ok(Self::Degraded),
            other => Err(format!("unknown tenant state '{other}'")),
        }
    }
}

/// Overall compliance of one namespace against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    /// Every declared table, column and index is present.
    Compliant,
    /// All declared tables exist but some columns or indexes are missing or mismatched.
    Partial,
    /// At least one declared table is absent.
    NonCompliant,
}

impl ValidationStatus {
    /// Stable textual form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::Partial => "partial",
            Self::NonCompliant => "non_compliant",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared column whose live type differs from the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMismatch {
    pub column: String,
    pub expected: String,
    pub actual: String,
}

/// Drift found for a single registry entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDiff {
    /// Registry entity (table) name.
    pub entity: String,
    /// The whole table is absent; column and index lists then enumerate everything declared.
    pub table_missing: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_indexes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_mismatches: Vec<ColumnMismatch>,
}

impl EntityDiff {
    /// Returns `true` if this entry carries no drift.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.table_missing
            && self.missing_columns.is_empty()
            && self.missing_indexes.is_empty()
            && self.type_mismatches.is_empty()
    }
}

/// Derived snapshot comparing a live namespace to the registry.
///
/// Never persisted: the live database and the registry are the truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub scope: Scope,
    pub namespace: String,
    pub namespace_exists: bool,
    pub expected_entity_count: usize,
    pub found_entity_count: usize,
    /// Only entities with drift are listed.
    pub diffs: Vec<EntityDiff>,
    pub status: ValidationStatus,
}

impl ValidationResult {
    /// Returns `true` when the namespace fully matches the registry.
    #[must_use]
    pub fn is_compliant(&self) -> bool {
        self.status == ValidationStatus::Compliant
    }

    /// Looks up the diff for one entity.
    #[must_use]
    pub fn diff_for(&self, entity: &str) -> Option<&EntityDiff> {
        self.diffs.iter().find(|d| d.entity == entity)
    }
}

/// A declared index absent from the live catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGap {
    pub entity: String,
    pub index: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Category of a drifted field in the fleet statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    MissingTable,
    MissingColumn,
    MissingIndex,
    TypeMismatch,
}

/// How many namespaces share one particular drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDriftStat {
    pub entity: String,
    /// Column or index name; the entity name itself for [`DriftKind::MissingTable`].
    pub field: String,
    pub kind: DriftKind,
    pub affected_namespaces: usize,
}

/// Health of one tenant inside a [`DriftReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantHealth {
    pub tenant_id: TenantId,
    pub namespace: String,
    pub state: TenantState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ValidationResult>,
    /// Set when the tenant could not be validated at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fleet-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub total: usize,
    pub compliant: usize,
    pub partial: usize,
    pub non_compliant: usize,
    pub errored: usize,
    /// Share of compliant tenants in basis points (10 000 = 100%).
    pub compliance_bps: u32,
}

/// Fleet-wide health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub generated_at: DateTime<Utc>,
    pub shared: ValidationResult,
    pub tenants: Vec<TenantHealth>,
    pub summary: DriftSummary,
    pub field_stats: Vec<FieldDriftStat>,
}

impl DriftReport {
    /// Returns `true` if the shared namespace and every tenant are compliant.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.shared.is_compliant()
            && self.summary.errored == 0
            && self.summary.compliant == self.summary.total
    }
}
