//! PostgreSQL backend: sea-orm for transactions and catalog queries, a
//! separate raw sqlx pool for session-scoped advisory locks.
//!
//! Lock sessions stay pinned for the whole migration run, so they never come
//! out of the pool the migrations themselves need.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, FromQueryResult, RuntimeErr,
    SqlxPostgresConnector, Statement, TransactionTrait,
};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tenant_schema_sdk::{Scope, TenantId};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::{BackendResult, ChangeBatch, HeldLock, SchemaBackend, TenantRecord};
use crate::config::DatabaseConfig;
use crate::ddl;
use crate::error::BackendError;
use crate::ident::qualified;
use crate::live::{LiveColumn, LiveIndex, LiveNamespace, LiveTable};
use crate::migrations::LedgerEntry;

const LEDGER_TABLE: &str = "schema_migration_ledger";
const TENANTS_TABLE: &str = "schema_tenants";

/// Maps a sea-orm error onto the engine's backend taxonomy.
fn classify(err: &DbErr) -> BackendError {
    let message = err.to_string();
    match err {
        DbErr::ConnectionAcquire(_) => BackendError::connection(message),
        DbErr::Conn(RuntimeErr::SqlxError(e))
        | DbErr::Exec(RuntimeErr::SqlxError(e))
        | DbErr::Query(RuntimeErr::SqlxError(e)) => classify_sqlx(e, message),
        DbErr::Conn(_) => BackendError::connection(message),
        _ => BackendError::statement(message),
    }
}

fn classify_sqlx(err: &sqlx::Error, message: String) -> BackendError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::connection(message),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // query_canceled, raised by statement_timeout
            Some("57014") => BackendError::timeout(message),
            Some("23505") => BackendError::conflict(message),
            Some(code) if code.starts_with("08") => BackendError::connection(message),
            _ => BackendError::statement(message),
        },
        _ => BackendError::statement(message),
    }
}

fn db_err(err: DbErr) -> BackendError {
    classify(&err)
}

fn sqlx_err(err: sqlx::Error) -> BackendError {
    let message = err.to_string();
    classify_sqlx(&err, message)
}

fn ident_err(err: crate::error::SchemaError) -> BackendError {
    BackendError::statement(err.to_string())
}

fn lock_id(key: &str) -> i64 {
    i64::from_ne_bytes(xxh3_64(key.as_bytes()).to_ne_bytes())
}

#[derive(Debug, FromQueryResult)]
struct ExistsRow {
    present: bool,
}

#[derive(Debug, FromQueryResult)]
struct TableRow {
    table_name: String,
}

#[derive(Debug, FromQueryResult)]
struct ColumnRow {
    table_name: String,
    column_name: String,
    data_type: String,
    is_nullable: String,
}

#[derive(Debug, FromQueryResult)]
struct IndexRow {
    table_name: String,
    index_name: String,
    is_unique: bool,
    columns: String,
}

#[derive(Debug, FromQueryResult)]
struct LedgerRow {
    id: i64,
    scope: String,
    namespace: String,
    version: i64,
    checksum: String,
    executed_at: DateTime<Utc>,
}

#[derive(Debug, FromQueryResult)]
struct TenantRow {
    tenant_id: String,
    namespace: String,
    state: String,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = BackendError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            scope: row.scope.parse().map_err(BackendError::statement)?,
            namespace: row.namespace,
            version: u32::try_from(row.version)
                .map_err(|_| BackendError::statement(format!("ledger version {} out of range", row.version)))?,
            checksum: row.checksum,
            executed_at: row.executed_at,
        })
    }
}

impl TryFrom<TenantRow> for TenantRecord {
    type Error = BackendError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        Ok(Self {
            tenant_id: TenantId::new(row.tenant_id).map_err(|e| BackendError::statement(e.to_string()))?,
            namespace: row.namespace,
            state: row.state.parse().map_err(BackendError::statement)?,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

/// Session-level advisory lock pinned to one pooled connection.
struct PgLock {
    id: i64,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl HeldLock for PgLock {
    async fn release(mut self: Box<Self>) -> BackendResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let res = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.id)
            .fetch_one(&mut *conn)
            .await;
        match res {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(lock_id = self.id, "Advisory lock was not held at release");
                Ok(())
            }
            Err(e) => {
                // Never hand a connection that may still hold the lock back to the pool.
                drop(conn.detach());
                Err(sqlx_err(e))
            }
        }
    }
}

impl Drop for PgLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Closing the session frees every advisory lock it holds.
            drop(conn.detach());
        }
    }
}

/// Backend over a PostgreSQL database.
#[derive(Clone)]
pub struct PgBackend {
    db: DatabaseConnection,
    locks: PgPool,
    public: String,
}

impl PgBackend {
    /// Opens the work pool and the lock pool.
    ///
    /// # Errors
    ///
    /// Returns a connection error if the database cannot be reached.
    pub async fn connect(cfg: &DatabaseConfig, public_namespace: &str) -> BackendResult<Self> {
        let pool = Self::open(cfg, cfg.max_conns).await?;
        let locks = Self::open(cfg, cfg.lock_conns).await?;
        Ok(Self::from_pools(pool, locks, public_namespace))
    }

    /// Wraps existing pools. `locks` only ever serves advisory lock sessions.
    pub fn from_pools(pool: PgPool, locks: PgPool, public_namespace: &str) -> Self {
        let db = SqlxPostgresConnector::from_sqlx_postgres_pool(pool);
        Self {
            db,
            locks,
            public: public_namespace.to_owned(),
        }
    }

    async fn open(cfg: &DatabaseConfig, max_conns: u32) -> BackendResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(max_conns)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.dsn)
            .await
            .map_err(|e| BackendError::connection(e.to_string()))
    }

    fn stmt(sql: &str, values: Vec<sea_orm::Value>) -> Statement {
        Statement::from_sql_and_values(DatabaseBackend::Postgres, sql, values)
    }

    fn table(&self, name: &str) -> BackendResult<String> {
        qualified(&self.public, name).map_err(ident_err)
    }

    async fn exists(&self, sql: &str, values: Vec<sea_orm::Value>) -> BackendResult<bool> {
        let row = ExistsRow::find_by_statement(Self::stmt(sql, values))
            .one(&self.db)
            .await
            .map_err(db_err)?;
        Ok(row.is_some_and(|r| r.present))
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_catalog(&self) -> BackendResult<()> {
        let ledger = self.table(LEDGER_TABLE)?;
        let tenants = self.table(TENANTS_TABLE)?;
        let statements = [
            ddl::create_namespace(&self.public).map_err(ident_err)?,
            format!(
                "CREATE TABLE IF NOT EXISTS {ledger} (
                    id BIGSERIAL PRIMARY KEY,
                    scope TEXT NOT NULL,
                    namespace TEXT NOT NULL,
                    version BIGINT NOT NULL,
                    checksum TEXT NOT NULL,
                    executed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                    UNIQUE (scope, namespace, version)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {tenants} (
                    tenant_id TEXT PRIMARY KEY,
                    namespace TEXT NOT NULL UNIQUE,
                    state TEXT NOT NULL,
                    last_error TEXT,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ),
        ];
        for sql in statements {
            self.db.execute_unprepared(&sql).await.map_err(db_err)?;
        }
        debug!(public = %self.public, "Catalog tables ensured");
        Ok(())
    }

    async fn namespace_exists(&self, namespace: &str) -> BackendResult<bool> {
        self.exists(
            "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1) AS present",
            vec![namespace.into()],
        )
        .await
    }

    async fn create_namespace(&self, namespace: &str) -> BackendResult<bool> {
        let sql = ddl::create_namespace(namespace).map_err(ident_err)?;
        let existed = self.namespace_exists(namespace).await?;
        self.db.execute_unprepared(&sql).await.map_err(db_err)?;
        Ok(!existed)
    }

    async fn applied_migrations(&self, scope: Scope, namespace: &str) -> BackendResult<Vec<LedgerEntry>> {
        let sql = format!(
            "SELECT id, scope, namespace, version, checksum, executed_at FROM {} \
             WHERE scope = $1 AND namespace = $2 ORDER BY version",
            self.table(LEDGER_TABLE)?
        );
        LedgerRow::find_by_statement(Self::stmt(&sql, vec![scope.as_str().into(), namespace.into()]))
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect()
    }

    async fn apply_changes(&self, namespace: &str, batch: ChangeBatch<'_>) -> BackendResult<()> {
        let statements = batch
            .changes
            .iter()
            .map(|change| change.render(namespace))
            .collect::<Result<Vec<_>, _>>()
            .map_err(ident_err)?;

        let txn = self.db.begin().await.map_err(db_err)?;
        let timeout_ms = batch.statement_timeout.as_millis().max(1);
        let res: BackendResult<()> = async {
            txn.execute_unprepared(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
                .await
                .map_err(db_err)?;
            for sql in &statements {
                txn.execute_unprepared(sql).await.map_err(db_err)?;
            }
            if let Some(ledger) = batch.ledger {
                let sql = format!(
                    "INSERT INTO {} (scope, namespace, version, checksum) VALUES ($1, $2, $3, $4)",
                    self.table(LEDGER_TABLE)?
                );
                txn.execute(Self::stmt(
                    &sql,
                    vec![
                        ledger.scope.as_str().into(),
                        namespace.into(),
                        i64::from(ledger.version).into(),
                        ledger.checksum.into(),
                    ],
                ))
                .await
                .map_err(db_err)?;
            }
            Ok(())
        }
        .await;

        match res {
            Ok(()) => txn.commit().await.map_err(db_err),
            Err(e) => {
                _ = txn.rollback().await;
                Err(e)
            }
        }
    }

    async fn describe_namespace(&self, namespace: &str) -> BackendResult<Option<LiveNamespace>> {
        if !self.namespace_exists(namespace).await? {
            return Ok(None);
        }

        let mut tables: BTreeMap<String, LiveTable> = TableRow::find_by_statement(Self::stmt(
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
            vec![namespace.into()],
        ))
        .all(&self.db)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(|r| (r.table_name, LiveTable::default()))
        .collect();

        let columns = ColumnRow::find_by_statement(Self::stmt(
            "SELECT table_name::text AS table_name, column_name::text AS column_name, \
                    data_type::text AS data_type, is_nullable::text AS is_nullable \
             FROM information_schema.columns WHERE table_schema = $1 \
             ORDER BY table_name, ordinal_position",
            vec![namespace.into()],
        ))
        .all(&self.db)
        .await
        .map_err(db_err)?;
        for row in columns {
            if let Some(table) = tables.get_mut(&row.table_name) {
                table.columns.insert(
                    row.column_name,
                    LiveColumn {
                        data_type: row.data_type,
                        nullable: row.is_nullable == "YES",
                    },
                );
            }
        }

        let indexes = IndexRow::find_by_statement(Self::stmt(
            "SELECT t.relname::text AS table_name, i.relname::text AS index_name, \
                    ix.indisunique AS is_unique, \
                    string_agg(a.attname::text, ',' ORDER BY k.ord) AS columns \
             FROM pg_catalog.pg_index ix \
             JOIN pg_catalog.pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace \
             CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord) \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum \
             WHERE n.nspname = $1 \
             GROUP BY t.relname, i.relname, ix.indisunique",
            vec![namespace.into()],
        ))
        .all(&self.db)
        .await
        .map_err(db_err)?;
        for row in indexes {
            if let Some(table) = tables.get_mut(&row.table_name) {
                table.indexes.insert(
                    row.index_name,
                    LiveIndex {
                        columns: row.columns.split(',').map(str::to_owned).collect(),
                        unique: row.is_unique,
                    },
                );
            }
        }

        Ok(Some(LiveNamespace { tables }))
    }

    async fn try_lock(&self, key: &str) -> BackendResult<Option<Box<dyn HeldLock>>> {
        let id = lock_id(key);
        let mut conn = match self.locks.acquire().await {
            Ok(conn) => conn,
            // Every lock session is pinned by another holder: busy, not broken.
            Err(sqlx::Error::PoolTimedOut) => {
                debug!(key, "Lock pool exhausted");
                return Ok(None);
            }
            Err(e) => return Err(sqlx_err(e)),
        };
        let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .map_err(sqlx_err)?;
        if !locked {
            return Ok(None);
        }
        Ok(Some(Box::new(PgLock { id, conn: Some(conn) })))
    }

    async fn save_tenant(&self, record: &TenantRecord) -> BackendResult<()> {
        let sql = format!(
            "INSERT INTO {} (tenant_id, namespace, state, last_error, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id) DO UPDATE SET \
                namespace = EXCLUDED.namespace, state = EXCLUDED.state, \
                last_error = EXCLUDED.last_error, updated_at = EXCLUDED.updated_at",
            self.table(TENANTS_TABLE)?
        );
        self.db
            .execute(Self::stmt(
                &sql,
                vec![
                    record.tenant_id.as_str().into(),
                    record.namespace.as_str().into(),
                    record.state.as_str().into(),
                    record.last_error.clone().into(),
                    record.updated_at.into(),
                ],
            ))
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_tenant(&self, tenant: &TenantId) -> BackendResult<Option<TenantRecord>> {
        let sql = format!(
            "SELECT tenant_id, namespace, state, last_error, updated_at FROM {} WHERE tenant_id = $1",
            self.table(TENANTS_TABLE)?
        );
        TenantRow::find_by_statement(Self::stmt(&sql, vec![tenant.as_str().into()]))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(TenantRecord::try_from)
            .transpose()
    }

    async fn list_tenants(&self) -> BackendResult<Vec<TenantRecord>> {
        let sql = format!(
            "SELECT tenant_id, namespace, state, last_error, updated_at FROM {} ORDER BY tenant_id",
            self.table(TENANTS_TABLE)?
        );
        TenantRow::find_by_statement(Self::stmt(&sql, vec![]))
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(TenantRecord::try_from)
            .collect()
    }
}
