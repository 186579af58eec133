//! Safe identifier handling.
//!
//! Every namespace, table, column and index name that reaches SQL text goes
//! through [`quote_ident`]. Names are validated against a strict pattern first,
//! so quoting never has to escape anything and external input can never
//! terminate the identifier.

use std::sync::LazyLock;

use regex::Regex;
use tenant_schema_sdk::TenantId;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, SchemaError};

/// `PostgreSQL` truncates identifiers beyond this many bytes.
pub const PG_IDENT_MAX: usize = 63;

/// Placeholder substituted with the quoted namespace in SQL templates.
pub const NAMESPACE_PLACEHOLDER: &str = "{{schema}}";

const HASH_LEN: usize = 8;
const HASH_SEPARATOR: &str = "__";

static IDENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap()
});

/// Checks that `name` is a lowercase identifier usable without escaping.
///
/// # Errors
///
/// Returns [`SchemaError::InvalidIdentifier`] if the name is empty, longer than
/// [`PG_IDENT_MAX`] bytes, or contains anything but `[a-z0-9_]`.
pub fn validate_ident(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > PG_IDENT_MAX {
        "longer than 63 bytes"
    } else if !IDENT_RE.is_match(name) {
        "only lowercase letters, digits and '_' are allowed, and it must not start with a digit"
    } else if name.starts_with("pg_") {
        "the 'pg_' prefix is reserved"
    } else {
        return Ok(());
    };
    Err(SchemaError::InvalidIdentifier {
        ident: name.to_owned(),
        reason: reason.to_owned(),
    })
}

/// Validates and double-quotes an identifier.
///
/// # Errors
///
/// See [`validate_ident`].
pub fn quote_ident(name: &str) -> Result<String> {
    validate_ident(name)?;
    Ok(format!("\"{name}\""))
}

/// `"namespace"."object"`
///
/// # Errors
///
/// See [`validate_ident`].
pub fn qualified(namespace: &str, object: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(namespace)?, quote_ident(object)?))
}

/// Replaces [`NAMESPACE_PLACEHOLDER`] with the quoted namespace.
///
/// # Errors
///
/// See [`validate_ident`].
pub fn substitute_namespace(template: &str, namespace: &str) -> Result<String> {
    let quoted = quote_ident(namespace)?;
    Ok(template.replace(NAMESPACE_PLACEHOLDER, &quoted))
}

/// Maps a tenant to a safe identifier fragment.
///
/// Allowed: `[a-z0-9_]`. Uppercase ASCII is lowered, everything else becomes `_`.
fn sanitize_tenant(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

/// Derives namespace names from tenant identifiers.
#[derive(Debug, Clone)]
pub struct NamespaceNaming {
    prefix: String,
}

impl NamespaceNaming {
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidIdentifier`] if the prefix is not a valid
    /// identifier or leaves less than 16 bytes for the tenant part.
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        validate_ident(&prefix)?;
        if prefix.len() > PG_IDENT_MAX - 16 {
            return Err(SchemaError::InvalidIdentifier {
                ident: prefix,
                reason: "namespace prefix is too long".to_owned(),
            });
        }
        Ok(Self { prefix })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Deterministic namespace for a tenant.
    ///
    /// Format: `<prefix><tenant>` when the tenant id is already a lowercase
    /// identifier that fits and the result has no `__`, otherwise
    /// `<prefix><sanitized>__<hash8>`, where `<hash8>` is derived from the
    /// ORIGINAL id. Direct names never contain `__` and hashed names always
    /// do, so the two forms cannot collide.
    #[must_use]
    pub fn namespace_for(&self, tenant: &TenantId) -> String {
        let raw = tenant.as_str();
        let sanitized = sanitize_tenant(raw);
        let budget = PG_IDENT_MAX - self.prefix.len();

        let direct = format!("{}{sanitized}", self.prefix);
        if sanitized == raw && sanitized.len() <= budget && !direct.contains(HASH_SEPARATOR) {
            return direct;
        }

        let hash = xxh3_64(raw.as_bytes());
        let hash8 = &format!("{hash:016x}")[..HASH_LEN];
        let keep = budget - HASH_LEN - HASH_SEPARATOR.len();
        let head: String = sanitized.chars().take(keep).collect();
        format!("{}{head}{HASH_SEPARATOR}{hash8}", self.prefix)
    }
}

/// Advisory lock key for a namespace.
#[must_use]
pub fn lock_key(scope: tenant_schema_sdk::Scope, namespace: &str) -> String {
    match scope {
        tenant_schema_sdk::Scope::Shared => format!("shared:{namespace}"),
        tenant_schema_sdk::Scope::PerTenant => format!("tenant:{namespace}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    #[test]
    fn quote_rejects_injection_attempts() {
        assert_eq!(quote_ident("tickets").unwrap(), "\"tickets\"");
        for bad in [
            "",
            "Tickets",
            "tickets\"; drop table x; --",
            "1tickets",
            "pg_catalog",
            "a b",
        ] {
            assert!(quote_ident(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(quote_ident(&"a".repeat(64)).is_err());
        assert!(quote_ident(&"a".repeat(63)).is_ok());
    }

    #[test]
    fn qualified_and_substitution() {
        assert_eq!(
            qualified("tenant_acme", "tickets").unwrap(),
            "\"tenant_acme\".\"tickets\""
        );
        assert_eq!(
            substitute_namespace("UPDATE {{schema}}.tickets SET x = 1", "tenant_acme").unwrap(),
            "UPDATE \"tenant_acme\".tickets SET x = 1"
        );
        assert!(substitute_namespace("SELECT 1", "Bad Name").is_err());
    }

    #[test]
    fn simple_tenant_ids_map_directly() {
        let naming = NamespaceNaming::new("tenant_").unwrap();
        assert_eq!(naming.namespace_for(&tenant("acme")), "tenant_acme");
        assert_eq!(naming.namespace_for(&tenant("acme_42")), "tenant_acme_42");
    }

    #[test]
    fn unsafe_tenant_ids_get_hashed_suffix() {
        let naming = NamespaceNaming::new("tenant_").unwrap();
        let upper = naming.namespace_for(&tenant("Acme"));
        let lower = naming.namespace_for(&tenant("acme"));
        assert_ne!(upper, lower, "case must not collide");
        assert!(upper.starts_with("tenant_acme_"));
        validate_ident(&upper).unwrap();

        let weird = naming.namespace_for(&tenant("acme\"; drop schema public; --"));
        validate_ident(&weird).unwrap();
        assert_eq!(
            weird,
            naming.namespace_for(&tenant("acme\"; drop schema public; --")),
            "deterministic"
        );
    }

    #[test]
    fn direct_and_hashed_names_never_collide() {
        let naming = NamespaceNaming::new("tenant_").unwrap();
        let hashed = naming.namespace_for(&tenant("Acme"));
        let suffix = hashed.strip_prefix("tenant_").unwrap();

        // An id spelled like another tenant's hashed namespace is hashed too.
        let lookalike = naming.namespace_for(&tenant(suffix));
        assert_ne!(lookalike, hashed);
        assert!(lookalike.contains("__"));
        validate_ident(&lookalike).unwrap();

        let single = hashed.replacen("__", "_", 1);
        let single = single.strip_prefix("tenant_").unwrap();
        assert_eq!(naming.namespace_for(&tenant(single)), format!("tenant_{single}"));
        assert_ne!(naming.namespace_for(&tenant(single)), hashed);

        let leading = naming.namespace_for(&tenant("_acme"));
        assert!(leading.starts_with("tenant__acme__"), "{leading}");
    }

    #[test]
    fn long_tenant_ids_fit_the_identifier_limit() {
        let naming = NamespaceNaming::new("tenant_").unwrap();
        let long = "x".repeat(120);
        let ns = naming.namespace_for(&tenant(&long));
        assert!(ns.len() <= PG_IDENT_MAX);
        validate_ident(&ns).unwrap();
    }

    #[test]
    fn prefix_is_validated() {
        assert!(NamespaceNaming::new("Tenant-").is_err());
        assert!(NamespaceNaming::new("t".repeat(50)).is_err());
    }

    #[test]
    fn lock_keys_separate_scopes() {
        use tenant_schema_sdk::Scope;
        assert_eq!(lock_key(Scope::Shared, "public"), "shared:public");
        assert_eq!(lock_key(Scope::PerTenant, "tenant_a"), "tenant:tenant_a");
    }
}
