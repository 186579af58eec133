//! Error taxonomy of the schema engine.

use std::time::Duration;

use tenant_schema_sdk::{Scope, TenantId};
use thiserror::Error;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, SchemaError>;

/// Classification of a failure reported by a [`SchemaBackend`](crate::backend::SchemaBackend).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Could not reach the database or lost the connection.
    Connection,
    /// The database rejected a statement.
    Statement,
    /// A statement exceeded its time budget and was rolled back.
    Timeout,
    /// A uniqueness constraint fired (for example a duplicate ledger row).
    Conflict,
}

/// Failure raised by a storage backend.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Statement,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Conflict,
            message: message.into(),
        }
    }
}

/// Typed error for every engine operation.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Database unreachable. Transient: safe to retry with backoff.
    #[error("database connection failed: {0}")]
    Connection(String),

    /// A migration statement failed. Permanent until the statement or environment is fixed.
    #[error("migration {version} failed for {scope} namespace '{namespace}': {cause}")]
    MigrationFailed {
        scope: Scope,
        namespace: String,
        version: u32,
        cause: String,
    },

    /// The per-namespace lock is held by someone else. Transient.
    #[error("could not lock namespace '{namespace}' within {waited:?}")]
    LockContention { namespace: String, waited: Duration },

    /// Drift the non-destructive policy refuses to repair.
    #[error("refusing to heal '{entity}' in namespace '{namespace}': {detail}")]
    HealingUnsafe {
        namespace: String,
        entity: String,
        detail: String,
    },

    /// Registry or migration definitions contradict themselves. Fatal at startup.
    #[error("schema registry is inconsistent: {0}")]
    RegistryInconsistency(String),

    /// A published migration was edited after being applied.
    #[error(
        "migration {version} in namespace '{namespace}' was applied with checksum {recorded}, definition now has {expected}"
    )]
    ChecksumMismatch {
        namespace: String,
        version: u32,
        recorded: String,
        expected: String,
    },

    /// A pending version is older than one already applied.
    #[error(
        "migration {version} for namespace '{namespace}' is older than applied version {latest_applied}"
    )]
    OutOfOrder {
        namespace: String,
        version: u32,
        latest_applied: u32,
    },

    /// Healing was requested while the engine runs in validation-only mode.
    #[error("healing is disabled; namespace '{namespace}' was not modified")]
    HealingDisabled { namespace: String },

    #[error("invalid identifier '{ident}': {reason}")]
    InvalidIdentifier { ident: String, reason: String },

    #[error("tenant '{0}' is not known to the engine")]
    UnknownTenant(TenantId),

    #[error("configuration error: {0}")]
    Config(String),

    /// Any other backend failure, with the namespace it happened in.
    #[error("backend error in namespace '{namespace}': {source}")]
    Backend {
        namespace: String,
        #[source]
        source: BackendError,
    },
}

impl SchemaError {
    /// Returns `true` for failures that may clear on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::LockContention { .. })
    }

    /// Wraps a backend failure, promoting connection errors to [`SchemaError::Connection`].
    pub(crate) fn backend(namespace: &str, source: BackendError) -> Self {
        if source.kind == BackendErrorKind::Connection {
            return Self::Connection(source.message);
        }
        Self::Backend {
            namespace: namespace.to_owned(),
            source,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn only_connection_and_lock_errors_are_transient() {
        assert!(SchemaError::Connection("down".to_owned()).is_transient());
        assert!(
            SchemaError::LockContention {
                namespace: "tenant_acme".to_owned(),
                waited: Duration::from_secs(1),
            }
            .is_transient()
        );
        assert!(
            !SchemaError::MigrationFailed {
                scope: Scope::PerTenant,
                namespace: "tenant_acme".to_owned(),
                version: 5,
                cause: "syntax error".to_owned(),
            }
            .is_transient()
        );
        assert!(!SchemaError::RegistryInconsistency("dup".to_owned()).is_transient());
    }

    #[test]
    fn backend_connection_errors_are_promoted() {
        let err = SchemaError::backend("public", BackendError::connection("refused"));
        assert!(matches!(err, SchemaError::Connection(_)));

        let err = SchemaError::backend("public", BackendError::statement("bad sql"));
        assert!(matches!(err, SchemaError::Backend { .. }));
    }
}
