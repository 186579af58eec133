//! Engine configuration.
//!
//! Layering, later layers win:
//! 1. built-in defaults
//! 2. optional YAML file
//! 3. environment variables `TENANT_SCHEMA__<KEY>`, nested with `__`
//!    (for example `TENANT_SCHEMA__DATABASE__DSN`, `TENANT_SCHEMA__LOCK_TIMEOUT=10s`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backend::LockSettings;
use crate::error::{Result, SchemaError};
use crate::ident::{NamespaceNaming, validate_ident};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TENANT_SCHEMA__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub dsn: String,
    pub max_conns: u32,
    /// Size of the separate pool whose sessions hold advisory locks.
    pub lock_conns: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "postgres://postgres@localhost:5432/postgres".to_owned(),
            max_conns: 10,
            lock_conns: 4,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Backoff for transient failures in `ensure_tenant_ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftConfig {
    /// Tenants validated concurrently by the drift reporter.
    pub concurrency: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TenantSchemaConfig {
    pub database: DatabaseConfig,
    /// Shared namespace; also hosts the ledger and tenant tables.
    pub public_namespace: String,
    pub tenant_namespace_prefix: String,
    /// YAML with `entities` and `migrations`. Built-in definitions when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definitions_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub statement_timeout: Duration,
    /// `false` = validation-only mode.
    pub healing_enabled: bool,
    pub retry: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub ready_cache_ttl: Duration,
    pub drift: DriftConfig,
    pub logging: LoggingConfig,
}

impl Default for TenantSchemaConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            public_namespace: "public".to_owned(),
            tenant_namespace_prefix: "tenant_".to_owned(),
            definitions_path: None,
            lock_timeout: Duration::from_secs(30),
            lock_initial_backoff: Duration::from_millis(50),
            statement_timeout: Duration::from_secs(30),
            healing_enabled: true,
            retry: RetryConfig::default(),
            ready_cache_ttl: Duration::from_secs(30),
            drift: DriftConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TenantSchemaConfig {
    /// Loads defaults, then `path` (if any), then the environment, and validates.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Config`] if the file is missing or malformed,
    /// a value has the wrong type, or [`validate`](Self::validate) fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(SchemaError::Config(format!(
                    "config file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| SchemaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let bad = |key: &str, why: &str| Err(SchemaError::Config(format!("{key}: {why}")));

        if self.database.dsn.trim().is_empty() {
            return bad("database.dsn", "must not be empty");
        }
        if self.database.max_conns == 0 {
            return bad("database.max_conns", "must be at least 1");
        }
        if self.database.lock_conns == 0 {
            return bad("database.lock_conns", "must be at least 1");
        }
        for (key, value) in [
            ("database.acquire_timeout", self.database.acquire_timeout),
            ("lock_timeout", self.lock_timeout),
            ("statement_timeout", self.statement_timeout),
            ("retry.initial_backoff", self.retry.initial_backoff),
        ] {
            if value.is_zero() {
                return bad(key, "must be greater than zero");
            }
        }
        if self.retry.max_attempts == 0 {
            return bad("retry.max_attempts", "must be at least 1");
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return bad("retry.max_backoff", "must not be below retry.initial_backoff");
        }
        if self.drift.concurrency == 0 {
            return bad("drift.concurrency", "must be at least 1");
        }
        if let Err(e) = validate_ident(&self.public_namespace) {
            return bad("public_namespace", &e.to_string());
        }
        if let Err(e) = NamespaceNaming::new(self.tenant_namespace_prefix.clone()) {
            return bad("tenant_namespace_prefix", &e.to_string());
        }
        if self.public_namespace.starts_with(&self.tenant_namespace_prefix) {
            return bad("public_namespace", "must not start with the tenant namespace prefix");
        }
        Ok(())
    }

    #[must_use]
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: self.lock_timeout,
            initial_backoff: self.lock_initial_backoff,
        }
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidIdentifier`] for an invalid prefix.
    pub fn naming(&self) -> Result<NamespaceNaming> {
        NamespaceNaming::new(self.tenant_namespace_prefix.clone())
    }

    /// DSN safe to print.
    #[must_use]
    pub fn redacted_dsn(&self) -> String {
        redact_dsn(&self.database.dsn)
    }
}

const REDACTED: &str = "***REDACTED***";

fn is_secret_param(key: &str) -> bool {
    key.eq_ignore_ascii_case("password") || key.eq_ignore_ascii_case("sslpassword")
}

/// Masks the password of a DSN, in the userinfo or in the query string.
/// Unparseable input is masked entirely.
#[must_use]
pub fn redact_dsn(dsn: &str) -> String {
    let Ok(mut url) = Url::parse(dsn) else {
        return "<redacted>".to_owned();
    };
    if url.password().is_some() {
        _ = url.set_password(Some(REDACTED));
    }
    if url.query_pairs().any(|(key, _)| is_secret_param(&key)) {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                let value = if is_secret_param(&key) {
                    REDACTED.to_owned()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = TenantSchemaConfig::default();
        cfg.validate().unwrap();
        assert!(cfg.healing_enabled);
        assert_eq!(cfg.lock_settings().timeout, Duration::from_secs(30));
    }

    #[test]
    fn yaml_then_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database:\n  dsn: postgres://app:secret@db:5432/app\nlock_timeout: 5s\nhealing_enabled: false\ndrift:\n  concurrency: 2"
        )
        .unwrap();

        temp_env::with_vars(
            [
                ("TENANT_SCHEMA__LOCK_TIMEOUT", Some("750ms")),
                ("TENANT_SCHEMA__DATABASE__MAX_CONNS", Some("3")),
            ],
            || {
                let cfg = TenantSchemaConfig::load(Some(file.path())).unwrap();
                assert_eq!(cfg.lock_timeout, Duration::from_millis(750));
                assert_eq!(cfg.database.max_conns, 3);
                assert_eq!(cfg.drift.concurrency, 2);
                assert!(!cfg.healing_enabled);
                assert_eq!(cfg.statement_timeout, Duration::from_secs(30));
                assert_eq!(cfg.redacted_dsn(), "postgres://app:***REDACTED***@db:5432/app");
            },
        );
    }

    #[test]
    fn missing_file_and_unknown_keys_are_errors() {
        assert!(TenantSchemaConfig::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "lock_timout: 5s").unwrap();
        temp_env::with_vars_unset(["TENANT_SCHEMA__LOCK_TIMEOUT"], || {
            let err = TenantSchemaConfig::load(Some(file.path())).unwrap_err();
            assert!(matches!(err, SchemaError::Config(_)), "{err}");
        });
    }

    #[test]
    fn validation_rejects_zero_and_bad_names() {
        let mut cfg = TenantSchemaConfig {
            statement_timeout: Duration::ZERO,
            ..TenantSchemaConfig::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("statement_timeout"));

        cfg = TenantSchemaConfig::default();
        cfg.drift.concurrency = 0;
        assert!(cfg.validate().is_err());

        cfg = TenantSchemaConfig::default();
        cfg.public_namespace = "Public; drop".to_owned();
        assert!(cfg.validate().is_err());

        cfg = TenantSchemaConfig::default();
        cfg.tenant_namespace_prefix = "pub".to_owned();
        assert!(cfg.validate().is_err(), "public must not look like a tenant namespace");
    }

    #[test]
    fn dsn_without_credentials_is_unchanged() {
        assert_eq!(redact_dsn("postgres://localhost/db"), "postgres://localhost/db");
        assert_eq!(
            redact_dsn("postgres://user@localhost/db"),
            "postgres://user@localhost/db"
        );
    }

    #[test]
    fn password_in_query_string_is_masked() {
        let masked = redact_dsn("postgres://db:5432/app?user=app&password=hunter2&sslmode=require");
        assert!(!masked.contains("hunter2"), "{masked}");
        assert_eq!(
            masked,
            "postgres://db:5432/app?user=app&password=***REDACTED***&sslmode=require"
        );

        let both = redact_dsn("postgres://app:s3cret@db/app?sslpassword=k3y");
        assert!(!both.contains("s3cret") && !both.contains("k3y"), "{both}");

        assert_eq!(redact_dsn("host=db password=hunter2"), "<redacted>");
    }

    #[test]
    fn zero_lock_pool_is_rejected() {
        let mut cfg = TenantSchemaConfig::default();
        cfg.database.lock_conns = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("database.lock_conns"), "{err}");
    }
}
