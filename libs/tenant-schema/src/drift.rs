//! Fleet-wide drift reporting.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::{StreamExt, stream};
use tenant_schema_sdk::{
    DriftKind, DriftReport, DriftSummary, FieldDriftStat, Scope, TenantHealth, ValidationResult,
    ValidationStatus,
};
use tracing::{info, warn};

use crate::error::Result;
use crate::tenant::TenantNamespaceManager;
use crate::validator::SchemaValidator;

/// Validates the shared namespace and every known tenant.
pub struct DriftReporter {
    validator: SchemaValidator,
    tenants: Arc<TenantNamespaceManager>,
    public_namespace: String,
    concurrency: usize,
}

impl DriftReporter {
    pub fn new(
        validator: SchemaValidator,
        tenants: Arc<TenantNamespaceManager>,
        public_namespace: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            validator,
            tenants,
            public_namespace: public_namespace.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Builds the report. Tenants that cannot be validated are listed with
    /// their error instead of failing the whole report.
    ///
    /// # Errors
    ///
    /// Returns an error if the shared namespace or the tenant roster cannot be read.
    pub async fn report(&self) -> Result<DriftReport> {
        let shared = self
            .validator
            .validate(Scope::Shared, &self.public_namespace)
            .await?;
        let roster = self.tenants.list().await?;

        let mut tenants: Vec<TenantHealth> = stream::iter(roster)
            .map(|record| async move {
                match self.validator.validate(Scope::PerTenant, &record.namespace).await {
                    Ok(result) => TenantHealth {
                        tenant_id: record.tenant_id,
                        namespace: record.namespace,
                        state: record.state,
                        result: Some(result),
                        error: None,
                    },
                    Err(e) => {
                        warn!(tenant = %record.tenant_id, error = %e, "Tenant could not be validated");
                        TenantHealth {
                            tenant_id: record.tenant_id,
                            namespace: record.namespace,
                            state: record.state,
                            result: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        let summary = summarize(&tenants);
        let field_stats = field_stats(
            std::iter::once(&shared).chain(tenants.iter().filter_map(|t| t.result.as_ref())),
        );

        info!(
            tenants = summary.total,
            compliant = summary.compliant,
            errored = summary.errored,
            compliance_bps = summary.compliance_bps,
            "Drift report generated"
        );
        Ok(DriftReport {
            generated_at: Utc::now(),
            shared,
            tenants,
            summary,
            field_stats,
        })
    }
}

fn summarize(tenants: &[TenantHealth]) -> DriftSummary {
    let mut summary = DriftSummary {
        total: tenants.len(),
        ..DriftSummary::default()
    };
    for tenant in tenants {
        match tenant.result.as_ref().map(|r| r.status) {
            Some(ValidationStatus::Compliant) => summary.compliant += 1,
            Some(ValidationStatus::Partial) => summary.partial += 1,
            Some(ValidationStatus::NonCompliant) => summary.non_compliant += 1,
            None => summary.errored += 1,
        }
    }
    summary.compliance_bps = compliance_bps(summary.compliant, summary.total);
    summary
}

/// Compliant share in basis points, truncated toward zero. An empty fleet is
/// fully compliant.
#[allow(clippy::integer_division)]
fn compliance_bps(compliant: usize, total: usize) -> u32 {
    if total == 0 {
        return 10_000;
    }
    u32::try_from(compliant.saturating_mul(10_000) / total).unwrap_or(10_000)
}

fn field_stats<'a>(results: impl Iterator<Item = &'a ValidationResult>) -> Vec<FieldDriftStat> {
    let mut counts: BTreeMap<(String, String, DriftKind), usize> = BTreeMap::new();
    let mut bump = |entity: &str, field: &str, kind: DriftKind| {
        *counts
            .entry((entity.to_owned(), field.to_owned(), kind))
            .or_default() += 1;
    };

    for result in results {
        for diff in &result.diffs {
            if diff.table_missing {
                bump(&diff.entity, &diff.entity, DriftKind::MissingTable);
                continue;
            }
            for column in &diff.missing_columns {
                bump(&diff.entity, column, DriftKind::MissingColumn);
            }
            for index in &diff.missing_indexes {
                bump(&diff.entity, index, DriftKind::MissingIndex);
            }
            for mismatch in &diff.type_mismatches {
                bump(&diff.entity, &mismatch.column, DriftKind::TypeMismatch);
            }
        }
    }

    let mut stats: Vec<FieldDriftStat> = counts
        .into_iter()
        .map(|((entity, field, kind), affected_namespaces)| FieldDriftStat {
            entity,
            field,
            kind,
            affected_namespaces,
        })
        .collect();
    // Most widespread drift first; ties keep the key order.
    stats.sort_by(|a, b| b.affected_namespaces.cmp(&a.affected_namespaces));
    stats
}
