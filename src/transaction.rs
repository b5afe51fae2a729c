//! Explicit transactions around migration scripts.
//!
//! A forward or backward script is applied inside `BEGIN`/`COMMIT`; any
//! statement error triggers `ROLLBACK` so the schema is left exactly as it
//! was before the script started.

use crate::executor::{DbError, Executor};
use may_postgres::types::ToSql;
use may_postgres::Row;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Transaction error type
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Error while issuing `BEGIN`, `COMMIT` or `ROLLBACK`
    #[error("transaction control failed: {0}")]
    Control(#[source] DbError),
    /// Transaction already committed or rolled back
    #[error("Transaction has already been committed or rolled back")]
    TransactionClosed,
}

impl From<TransactionError> for DbError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Control(e) => e,
            TransactionError::TransactionClosed => DbError::Other("Transaction closed".to_string()),
        }
    }
}

/// An open transaction on a borrowed executor.
///
/// Dropping an open transaction rolls it back.
pub struct Transaction<'a> {
    executor: &'a dyn Executor,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Issue `BEGIN` on `executor`.
    pub fn begin(executor: &'a dyn Executor) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        executor
            .execute("BEGIN", &[])
            .map_err(TransactionError::Control)?;

        Ok(Self {
            executor,
            closed: false,
        })
    }

    /// Commit the transaction
    pub fn commit(mut self) -> Result<(), TransactionError> {
        self.finish("COMMIT")
    }

    /// Rollback the transaction, discarding every change made inside it.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        self.finish("ROLLBACK")
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn finish(&mut self, statement: &str) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }
        self.closed = true;
        self.executor
            .execute(statement, &[])
            .map_err(TransactionError::Control)?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed {
            return Err(DbError::Other("Transaction is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            // Nothing to propagate to from drop; the session is reset either way.
            if let Err(e) = self.executor.execute("ROLLBACK", &[]) {
                log::warn!("rollback of abandoned transaction failed: {e}");
            }
        }
    }
}

impl Executor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.ensure_open()?;
        self.executor.execute(query, params)
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.ensure_open()?;
        self.executor.query_one(query, params)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.ensure_open()?;
        self.executor.query_all(query, params)
    }

    fn batch_execute(&self, script: &str) -> Result<(), DbError> {
        self.ensure_open()?;
        self.executor.batch_execute(script)
    }
}

/// Run `script` inside an explicit transaction.
///
/// On a statement error the transaction is rolled back and the statement
/// error is returned; the rollback itself failing is reported instead, since
/// the schema state is then unknown.
pub fn run_in_transaction(executor: &dyn Executor, script: &str) -> Result<(), DbError> {
    let tx = Transaction::begin(executor)?;
    match tx.batch_execute(script) {
        Ok(()) => {
            tx.commit()?;
            Ok(())
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::rollback_transaction_span().entered();

            log::debug!("script failed, rolling back: {e}");
            tx.rollback()?;
            Err(e)
        }
    }
}
