//! Migration ledger: the table recording which migrations are applied.
//!
//! The orchestrator writes a record after every forward application and
//! removes it after every backward application, then reads it back to verify
//! the bookkeeping matches the schema state.

use crate::executor::{quote_ident, DbError, Executor};
use chrono::{DateTime, Utc};

/// A row of the ledger table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRecord {
    pub version: i64,
    pub name: String,
    /// `SHA-256` of the migration pair
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,
    pub success: bool,
}

impl LedgerRecord {
    #[must_use]
    pub fn new(
        version: i64,
        name: String,
        checksum: String,
        applied_at: DateTime<Utc>,
        execution_time_ms: Option<i64>,
    ) -> Self {
        Self {
            version,
            name,
            checksum,
            applied_at,
            execution_time_ms,
            success: true,
        }
    }

    /// Expected column order: `version`, `name`, `checksum`, `applied_at`, `execution_time_ms`, `success`
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, DbError> {
        let get_err = |column: &str, e: may_postgres::Error| {
            DbError::ParseError(format!("ledger column '{column}': {e}"))
        };
        Ok(Self {
            version: row.try_get(0).map_err(|e| get_err("version", e))?,
            name: row.try_get(1).map_err(|e| get_err("name", e))?,
            checksum: row.try_get(2).map_err(|e| get_err("checksum", e))?,
            applied_at: row.try_get(3).map_err(|e| get_err("applied_at", e))?,
            execution_time_ms: row.try_get(4).map_err(|e| get_err("execution_time_ms", e))?,
            success: row.try_get(5).map_err(|e| get_err("success", e))?,
        })
    }
}

/// Create the ledger table if it does not exist.
pub fn initialize_ledger(executor: &dyn Executor, table: &str) -> Result<(), DbError> {
    let sql = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            version BIGINT PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            checksum VARCHAR(64) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL,
            execution_time_ms BIGINT,
            success BOOLEAN NOT NULL DEFAULT true
        )
        "#,
        table = quote_ident(table)
    );
    executor.execute(&sql, &[])?;
    Ok(())
}

/// Insert a record for an applied migration.
pub fn record_migration(
    executor: &dyn Executor,
    table: &str,
    record: &LedgerRecord,
) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO {} (version, name, checksum, applied_at, execution_time_ms, success) \
         VALUES ($1, $2, $3, $4, $5, $6)",
        quote_ident(table)
    );
    executor.execute(
        &sql,
        &[
            &record.version,
            &record.name,
            &record.checksum,
            &record.applied_at,
            &record.execution_time_ms,
            &record.success,
        ],
    )?;
    Ok(())
}

/// Delete the record for `version`; returns whether a record existed.
pub fn remove_migration_record(
    executor: &dyn Executor,
    table: &str,
    version: i64,
) -> Result<bool, DbError> {
    let sql = format!("DELETE FROM {} WHERE version = $1", quote_ident(table));
    let removed = executor.execute(&sql, &[&version])?;
    Ok(removed > 0)
}

/// Look up the record for `version`.
pub fn find_record(
    executor: &dyn Executor,
    table: &str,
    version: i64,
) -> Result<Option<LedgerRecord>, DbError> {
    let sql = format!(
        "SELECT version, name, checksum, applied_at, execution_time_ms, success \
         FROM {} WHERE version = $1",
        quote_ident(table)
    );
    let rows = executor.query_all(&sql, &[&version])?;
    match rows.as_slice() {
        [] => Ok(None),
        [row] => LedgerRecord::from_row(row).map(Some),
        _ => Err(DbError::QueryError(format!(
            "ledger holds {} records for version {version}",
            rows.len()
        ))),
    }
}

/// All recorded versions, ascending.
pub fn applied_versions(executor: &dyn Executor, table: &str) -> Result<Vec<i64>, DbError> {
    let sql = format!("SELECT version FROM {} ORDER BY version ASC", quote_ident(table));
    let rows = executor.query_all(&sql, &[])?;
    Ok(rows.iter().map(|r| r.get::<_, i64>(0)).collect())
}
