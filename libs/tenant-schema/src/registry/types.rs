//! Column type validation and canonicalization.
//!
//! The catalog reports types in their long SQL-standard spelling
//! (`character varying`, `timestamp with time zone`) while definitions use
//! whatever DDL spelling the author preferred. Both sides are reduced to the
//! same canonical form before comparison. Length and precision modifiers are
//! ignored.

use std::sync::LazyLock;

use regex::Regex;

static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z][a-z0-9_ ]*(\(\s*\d+(\s*,\s*\d+)?\s*\))?(\[\])?$").unwrap()
});

/// Returns `true` if `data_type` is a plain SQL type name, optionally with
/// precision and an array suffix.
#[must_use]
pub fn is_valid_type(data_type: &str) -> bool {
    let normalized = data_type.trim().to_ascii_lowercase();
    !normalized.is_empty() && TYPE_RE.is_match(&normalized)
}

/// Returns `true` if a default expression cannot smuggle extra statements.
#[must_use]
pub fn is_safe_default(expr: &str) -> bool {
    let trimmed = expr.trim();
    !trimmed.is_empty() && !trimmed.contains(';') && !trimmed.contains("--") && !trimmed.contains("/*")
}

/// Canonical spelling used for type comparison.
#[must_use]
pub fn canonical_type(data_type: &str) -> String {
    let lowered = data_type.trim().to_ascii_lowercase();
    if lowered.ends_with("[]") || lowered == "array" {
        return "array".to_owned();
    }
    let base = lowered
        .split('(')
        .next()
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let canonical = match base.as_str() {
        "varchar" | "character varying" => "character varying",
        "char" | "character" | "bpchar" => "character",
        "int" | "int4" | "integer" | "serial" | "serial4" => "integer",
        "bigint" | "int8" | "bigserial" | "serial8" => "bigint",
        "smallint" | "int2" | "smallserial" | "serial2" => "smallint",
        "bool" | "boolean" => "boolean",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        "timestamp" | "timestamp without time zone" => "timestamp without time zone",
        "timetz" | "time with time zone" => "time with time zone",
        "time" | "time without time zone" => "time without time zone",
        "decimal" | "numeric" => "numeric",
        "float" | "float8" | "double precision" => "double precision",
        "float4" | "real" => "real",
        other => other,
    };
    canonical.to_owned()
}

/// Returns `true` if both spellings denote the same column type.
#[must_use]
pub fn same_type(expected: &str, actual: &str) -> bool {
    canonical_type(expected) == canonical_type(actual)
}
