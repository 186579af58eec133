//! Human and JSON renderings of engine reports.

use colored::Colorize;
use serde::Serialize;
use tenant_schema::{CheckReport, HealReport, MigrationOutcome, ProvisionOutcome, RepairKind, SetupReport};
use tenant_schema_sdk::{
    DriftKind, DriftReport, EntityDiff, IndexGap, TenantState, ValidationResult, ValidationStatus,
};

const RULE_WIDTH: usize = 72;

pub struct Printer {
    json: bool,
}

impl Printer {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Prints `value` as pretty JSON in `--json` mode, otherwise through `human`.
    pub fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human(value);
        }
        Ok(())
    }

    pub fn error(&self, err: &anyhow::Error) {
        if self.json {
            let body = serde_json::json!({ "ok": false, "error": format!("{err:#}") });
            println!("{body}");
        } else {
            eprintln!("{} {err:#}", "error:".red().bold());
        }
    }
}

fn rule() {
    println!("{}", "-".repeat(RULE_WIDTH));
}

fn status_label(status: ValidationStatus) -> String {
    match status {
        ValidationStatus::Compliant => status.to_string().green().to_string(),
        ValidationStatus::Partial => status.to_string().yellow().to_string(),
        ValidationStatus::NonCompliant => status.to_string().red().bold().to_string(),
    }
}

fn state_label(state: TenantState) -> String {
    match state {
        TenantState::Ready => state.to_string().green().to_string(),
        TenantState::Degraded => state.to_string().red().to_string(),
        _ => state.to_string().yellow().to_string(),
    }
}

fn repair_label(kind: RepairKind) -> &'static str {
    match kind {
        RepairKind::CreateNamespace => "create namespace",
        RepairKind::CreateTable => "create table",
        RepairKind::AddColumn => "add column",
        RepairKind::CreateIndex => "create index",
    }
}

fn drift_label(kind: DriftKind) -> &'static str {
    match kind {
        DriftKind::MissingTable => "missing table",
        DriftKind::MissingColumn => "missing column",
        DriftKind::MissingIndex => "missing index",
        DriftKind::TypeMismatch => "type mismatch",
    }
}

fn versions(list: &[u32]) -> String {
    if list.is_empty() {
        return "none".to_owned();
    }
    list.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}

pub fn migration(outcome: &MigrationOutcome) {
    println!(
        "{} {} namespace '{}': {} applied, {} already present",
        "migrated".green().bold(),
        outcome.scope,
        outcome.namespace,
        outcome.applied,
        outcome.skipped
    );
    if !outcome.applied_versions.is_empty() {
        println!("  versions: {}", versions(&outcome.applied_versions));
    }
}

pub fn provision(outcome: &ProvisionOutcome) {
    let verb = if outcome.created { "created" } else { "exists" };
    println!(
        "tenant {} -> '{}' ({verb}, {})",
        outcome.tenant_id.to_string().bold(),
        outcome.namespace,
        state_label(outcome.state)
    );
    migration(&outcome.migration);
}

pub fn setup(report: &SetupReport) {
    migration(&report.migration);
    validation(&report.validation);
}

fn entity_diff(diff: &EntityDiff) {
    if diff.table_missing {
        println!("  {} table {}", "\u{2717}".red(), diff.entity.bold());
        return;
    }
    for column in &diff.missing_columns {
        println!("  {} column {}.{column}", "\u{2717}".red(), diff.entity);
    }
    for index in &diff.missing_indexes {
        println!("  {} index {index} on {}", "\u{2717}".yellow(), diff.entity);
    }
    for mismatch in &diff.type_mismatches {
        println!(
            "  {} {}.{} is {}, declared {}",
            "!=".red(),
            diff.entity,
            mismatch.column,
            mismatch.actual,
            mismatch.expected
        );
    }
}

pub fn validation(result: &ValidationResult) {
    println!(
        "{} namespace '{}': {} ({}/{} entities)",
        result.scope,
        result.namespace,
        status_label(result.status),
        result.found_entity_count,
        result.expected_entity_count
    );
    if !result.namespace_exists {
        println!("  {} namespace does not exist", "\u{2717}".red());
    }
    result.diffs.iter().for_each(entity_diff);
}

pub fn heal(report: &HealReport) {
    println!("healing {} namespace '{}'", report.scope, report.namespace);
    if report.actions.is_empty() && report.unsafe_diffs.is_empty() {
        println!("  nothing to repair");
    }
    for action in &report.actions {
        let mark = if action.succeeded() { "\u{2713}".green() } else { "\u{2717}".red() };
        println!("  {mark} {} {}", repair_label(action.kind), action.target);
        if let Some(note) = &action.note {
            println!("      {}", note.dimmed());
        }
        if let Some(error) = &action.error {
            println!("      {}", error.red());
        }
    }
    for diff in &report.unsafe_diffs {
        println!("  {} {}: {}", "!".red().bold(), diff.entity, diff.detail);
    }
    validation(&report.after);
}

pub fn gaps(namespace: &str, gaps: &[IndexGap]) {
    if gaps.is_empty() {
        println!("{} every declared index exists in '{namespace}'", "\u{2713}".green());
        return;
    }
    println!("{} missing index(es) in '{namespace}':", gaps.len());
    for gap in gaps {
        let unique = if gap.unique { "unique " } else { "" };
        println!(
            "  {} {unique}{} on {} ({})",
            "+".yellow(),
            gap.index.bold(),
            gap.entity,
            gap.columns.join(", ")
        );
    }
}

pub fn pending(namespace: &str, pending: &[u32]) {
    if pending.is_empty() {
        println!("{} '{namespace}' is up to date", "\u{2713}".green());
    } else {
        println!("pending for '{namespace}': {}", versions(pending));
    }
}

pub fn drift(report: &DriftReport) {
    rule();
    println!("  {}", "SCHEMA DRIFT REPORT".bold());
    println!("  generated at {}", report.generated_at.to_rfc3339());
    rule();
    validation(&report.shared);
    println!();

    for health in &report.tenants {
        match (&health.result, &health.error) {
            (Some(result), _) => println!(
                "  {:<24} {:<12} {}",
                health.tenant_id.as_str(),
                state_label(health.state),
                status_label(result.status)
            ),
            (None, Some(error)) => println!(
                "  {:<24} {:<12} {}",
                health.tenant_id.as_str(),
                state_label(health.state),
                error.red()
            ),
            (None, None) => println!("  {:<24} {}", health.tenant_id.as_str(), state_label(health.state)),
        }
    }

    let summary = &report.summary;
    println!();
    println!(
        "  tenants: {}  compliant: {}  partial: {}  non-compliant: {}  errored: {}",
        summary.total, summary.compliant, summary.partial, summary.non_compliant, summary.errored
    );
    println!(
        "  compliance: {}.{:02}%",
        summary.compliance_bps / 100,
        summary.compliance_bps % 100
    );

    if !report.field_stats.is_empty() {
        println!();
        println!("  most common drift:");
        for stat in report.field_stats.iter().take(10) {
            println!(
                "    {:<32} {:<15} {} namespace(s)",
                stat.field,
                drift_label(stat.kind),
                stat.affected_namespaces
            );
        }
    }
    rule();
    if report.is_healthy() {
        println!("{}", "\u{2713} no drift".green());
    } else {
        println!("{}", "\u{2717} drift detected".red());
    }
}

pub fn check(report: &CheckReport) {
    println!("backend:           {}", report.backend);
    println!("public namespace:  {}", report.public_namespace);
    println!(
        "entities:          {} shared, {} per tenant",
        report.shared_entities, report.tenant_entities
    );
    println!(
        "migrations:        {} shared, {} per tenant",
        report.shared_migrations, report.tenant_migrations
    );
    println!("pending shared:    {}", versions(&report.pending_shared));
    println!("known tenants:     {}", report.known_tenants);
    println!("{}", "\u{2713} ok".green());
}
