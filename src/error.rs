//! Error taxonomy.
//!
//! [`Error`] aborts a run: configuration, connection, discovery and
//! provisioning problems leave nothing to verify. [`VerifyError`] is a
//! verification finding; findings are collected into the
//! [`VerificationReport`](crate::orchestrator::VerificationReport) and never
//! stop the checks that follow.

use crate::connection::ConnectionError;
use crate::executor::DbError;
use crate::integrity::ForeignKeyOrphans;
use crate::migration::DiscoveryError;
use crate::orchestrator::{RunState, VerificationReport};
use crate::snapshot::SchemaDiff;
use crate::timeseries::TimeSeriesFeature;
use std::time::Duration;

/// Fatal run error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("migration discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("database error while {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: DbError,
    },

    #[error("invalid orchestrator transition from {from:?} to {to:?}")]
    InvalidTransition { from: RunState, to: RunState },

    /// A run stopped after the test database was touched; `report` holds
    /// the findings recorded up to that point.
    #[error("verification aborted after {} finding(s): {cause}", .report.failures().len())]
    Aborted {
        #[source]
        cause: Box<Error>,
        report: Box<VerificationReport>,
    },
}

impl Error {
    pub(crate) fn aborted(cause: Error, report: VerificationReport) -> Self {
        log::error!("verification aborted: {cause}\n{report}");
        Error::Aborted {
            cause: Box::new(cause),
            report: Box::new(report),
        }
    }

    pub(crate) fn database(context: impl Into<String>) -> impl FnOnce(DbError) -> Self {
        let context = context.into();
        move |source| Error::Database { context, source }
    }
}

/// A failed verification property
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Forward-then-backward did not restore the pre-migration schema
    #[error("migration {migration}: rollback left the schema changed\n{diff}")]
    SchemaDrift { migration: String, diff: SchemaDiff },

    /// Applying the forward script twice differs from applying it once
    #[error("migration {migration}: forward script is not idempotent\n{diff}")]
    NonIdempotentMigration { migration: String, diff: SchemaDiff },

    /// Child rows referencing parents that do not exist
    #[error("orphaned references found:{}", format_orphans(.relationships))]
    OrphanedReference { relationships: Vec<ForeignKeyOrphans> },

    /// Base table without a primary key
    #[error("table '{table}' has no primary key constraint")]
    MissingPrimaryKey { table: String },

    /// Expected time-series feature absent or misconfigured
    #[error("time-series {feature} check failed: {detail}")]
    TimeSeriesFeatureMissing {
        feature: TimeSeriesFeature,
        detail: String,
    },

    /// A statement failed at the database layer
    #[error("SQL error in {context}: {error}")]
    SqlExecution { context: String, error: String },

    /// Row count of a pre-existing table dropped across a migration
    #[error("migration {migration}: row count of '{table}' decreased from {before} to {after}")]
    DataLoss {
        migration: String,
        table: String,
        before: i64,
        after: i64,
    },

    /// Ledger does not reflect the migration state
    #[error("ledger mismatch for version {version}: {detail}")]
    LedgerMismatch { version: i64, detail: String },

    /// A failed transactional script left schema changes behind
    #[error("failed transactional script leaked schema changes\n{diff}")]
    TransactionLeak { diff: SchemaDiff },

    /// Run exceeded its wall-clock budget
    #[error("run exceeded its {}s budget after {:.1}s, before {step}", .budget.as_secs(), .elapsed.as_secs_f64())]
    BudgetExceeded {
        budget: Duration,
        elapsed: Duration,
        step: String,
    },
}

impl VerifyError {
    pub(crate) fn sql(context: impl Into<String>, error: &DbError) -> Self {
        VerifyError::SqlExecution {
            context: context.into(),
            error: error.to_string(),
        }
    }
}

fn format_orphans(relationships: &[ForeignKeyOrphans]) -> String {
    relationships
        .iter()
        .map(|r| format!("\n  {r}"))
        .collect()
}
