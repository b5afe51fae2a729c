//! Statement execution over `may_postgres`.
//!
//! Every component that touches the database takes a `&dyn Executor`, so the
//! orchestrator can hand out either the plain connection or an open
//! [`Transaction`](crate::transaction::Transaction).

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Database-layer error
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    PostgresError(#[from] PostgresError),
    /// Query produced an unexpected shape (no rows, wrong column count, ...)
    #[error("Query error: {0}")]
    QueryError(String),
    /// Row value could not be converted
    #[error("Parse error: {0}")]
    ParseError(String),
    /// Other execution errors
    #[error("Execution error: {0}")]
    Other(String),
}

/// Abstraction over anything that can run SQL against the test database.
///
/// # Examples
///
/// ```no_run
/// use tidewatch::{connect, Executor, MayPostgresExecutor};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = connect("host=localhost user=postgres password=postgres dbname=tidewatch_test")?;
/// let executor = MayPostgresExecutor::new(client);
///
/// executor.batch_execute("CREATE TABLE IF NOT EXISTS t (id INT PRIMARY KEY); INSERT INTO t VALUES (1);")?;
/// let row = executor.query_one("SELECT COUNT(*) FROM t", &[])?;
/// let count: i64 = row.get(0);
/// # Ok(())
/// # }
/// ```
pub trait Executor {
    /// Execute a single parameterised statement, returning the affected row count.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError>;

    /// Execute a query that must return exactly one row.
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError>;

    /// Execute a query and return every row.
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError>;

    /// Run a multi-statement script through the simple query protocol.
    ///
    /// Migration files hold several statements separated by `;`, which the
    /// extended protocol used by [`Executor::execute`] cannot run in one call.
    fn batch_execute(&self, script: &str) -> Result<(), DbError>;
}

/// `Executor` backed directly by a `may_postgres::Client`.
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn log_slow(query: &str, start: Instant) {
    let elapsed = start.elapsed();
    if elapsed.as_millis() > 1_000 {
        log::debug!(
            "statement took {}ms: {}",
            elapsed.as_millis(),
            query.lines().next().unwrap_or_default().trim()
        );
    }
}

impl Executor for MayPostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        let start = Instant::now();
        let result = self.client.execute(query, params).map_err(DbError::from);
        log_slow(query, start);
        result
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        let start = Instant::now();
        let result = self.client.query_one(query, params).map_err(DbError::from);
        log_slow(query, start);
        result
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        let start = Instant::now();
        let result = self.client.query(query, params).map_err(DbError::from);
        log_slow(query, start);
        result
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(script).entered();

        let start = Instant::now();
        let result = self.client.batch_execute(script).map_err(DbError::from);
        log_slow(script, start);
        result
    }
}

/// Quote an identifier for interpolation into SQL text.
///
/// Catalog names come back unquoted; tables created with mixed case or
/// reserved words only resolve when quoted.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
