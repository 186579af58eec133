use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use super::{HeldLock, SchemaBackend};
use crate::error::{Result, SchemaError};

const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How long to wait for a namespace lock.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    pub timeout: Duration,
    pub initial_backoff: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
        }
    }
}

/// Exclusive right to change one namespace.
///
/// Release explicitly with [`NamespaceLock::release`]. A dropped guard frees
/// the lock through the backend's own drop handling.
pub struct NamespaceLock {
    key: String,
    held: Option<Box<dyn HeldLock>>,
}

impl std::fmt::Debug for NamespaceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceLock")
            .field("key", &self.key)
            .field("held", &self.held.is_some())
            .finish()
    }
}

impl NamespaceLock {
    /// Polls [`SchemaBackend::try_lock`] with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::LockContention`] once `settings.timeout` has
    /// elapsed, or a backend error if the lock attempt itself fails.
    pub async fn acquire(
        backend: &dyn SchemaBackend,
        key: &str,
        namespace: &str,
        settings: LockSettings,
    ) -> Result<Self> {
        let started = Instant::now();
        let mut backoff = settings.initial_backoff.max(Duration::from_millis(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(held) = backend
                .try_lock(key)
                .await
                .map_err(|e| SchemaError::backend(namespace, e))?
            {
                debug!(key, attempts, "Namespace lock acquired");
                return Ok(Self {
                    key: key.to_owned(),
                    held: Some(held),
                });
            }

            let waited = started.elapsed();
            if waited >= settings.timeout {
                warn!(key, attempts, ?waited, "Gave up waiting for namespace lock");
                return Err(SchemaError::LockContention {
                    namespace: namespace.to_owned(),
                    waited,
                });
            }
            sleep(backoff.min(settings.timeout - waited)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock.
    ///
    /// A failed release is logged only: the backend guard is gone either way
    /// and its drop path frees the lock.
    pub async fn release(mut self) {
        if let Some(held) = self.held.take()
            && let Err(e) = held.release().await
        {
            warn!(key = %self.key, error = %e, "Failed to release namespace lock cleanly");
        }
    }
}
