//! Test database provisioning.
//!
//! `CREATE DATABASE` and `DROP DATABASE` cannot run inside a transaction
//! block, so everything here goes through plain auto-commit statements.

use crate::executor::{quote_ident, DbError, Executor};

const TERMINATE_SESSIONS_SQL: &str = r#"
    SELECT pg_terminate_backend(pid)
    FROM pg_stat_activity
    WHERE datname = $1
      AND pid <> pg_backend_pid()
"#;

/// Disconnect every other session from `name`.
pub fn terminate_sessions(admin: &dyn Executor, name: &str) -> Result<usize, DbError> {
    let terminated = admin.query_all(TERMINATE_SESSIONS_SQL, &[&name])?.len();
    if terminated > 0 {
        log::debug!("terminated {terminated} session(s) on {name}");
    }
    Ok(terminated)
}

/// Drop `name` if it exists and create it empty.
pub fn recreate_database(admin: &dyn Executor, name: &str) -> Result<(), DbError> {
    drop_database(admin, name)?;
    admin.execute(&format!("CREATE DATABASE {}", quote_ident(name)), &[])?;
    log::info!("created test database {name}");
    Ok(())
}

pub fn drop_database(admin: &dyn Executor, name: &str) -> Result<(), DbError> {
    terminate_sessions(admin, name)?;
    admin.execute(&format!("DROP DATABASE IF EXISTS {}", quote_ident(name)), &[])?;
    Ok(())
}

/// Install `timescaledb`; returns the installed version.
pub fn enable_extension(executor: &dyn Executor) -> Result<String, DbError> {
    executor.execute("CREATE EXTENSION IF NOT EXISTS timescaledb", &[])?;
    let version: String = executor
        .query_one(
            "SELECT extversion::text FROM pg_extension WHERE extname = 'timescaledb'",
            &[],
        )?
        .get(0);
    log::info!("timescaledb {version} enabled");
    Ok(version)
}

/// Create `schema` unless it already exists.
pub fn ensure_schema(executor: &dyn Executor, schema: &str) -> Result<(), DbError> {
    executor.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)), &[])?;
    Ok(())
}

/// `SET` statement bounding any single statement of the session; `0` disables.
pub fn statement_timeout_sql(seconds: u64) -> String {
    format!("SET statement_timeout = {}", seconds.saturating_mul(1000))
}

pub fn set_statement_timeout(executor: &dyn Executor, seconds: u64) -> Result<(), DbError> {
    executor.batch_execute(&statement_timeout_sql(seconds))
}

/// Make unqualified names in migration scripts resolve to `schema`.
pub fn search_path_sql(schema: &str) -> String {
    if schema == "public" {
        "SET search_path = public".to_string()
    } else {
        format!("SET search_path = {}, public", quote_ident(schema))
    }
}
