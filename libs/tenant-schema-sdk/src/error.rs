//! Error types exposed to consumers of the tenant schema engine.

use thiserror::Error;

use crate::models::TenantId;

/// Rejected tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidTenantId {
    #[error("tenant id must not be empty")]
    Empty,
    #[error("tenant id is {len} bytes long, the limit is {max}", max = crate::models::TENANT_ID_MAX_LEN)]
    TooLong { len: usize },
    #[error("tenant id must not contain control characters")]
    ControlCharacter,
}

/// Errors returned through [`TenantSchemaClient`](crate::TenantSchemaClient).
///
/// The CRUD layer only needs to distinguish "not ready" from internal faults;
/// the detailed engine taxonomy stays inside the engine.
#[derive(Debug, Clone, Error)]
pub enum TenantSchemaError {
    /// The tenant namespace cannot serve queries yet.
    ///
    /// When `retryable` is `true` the condition is expected to clear on its own
    /// (lock contention, connection loss); callers should answer with a
    /// service-unavailable response and let the client retry.
    #[error("tenant '{tenant_id}' is not ready: {reason}")]
    NotReady {
        tenant_id: TenantId,
        reason: String,
        retryable: bool,
    },

    /// Anything else; needs operator attention.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TenantSchemaError {
    /// Returns `true` if the request may be retried later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotReady { retryable: true, .. })
    }

    /// Returns `true` for the "tenant not ready" signal.
    #[must_use]
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}
