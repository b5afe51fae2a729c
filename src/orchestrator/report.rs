//! Aggregated outcome of a verification run.

use crate::conflict::ConflictReport;
use crate::error::VerifyError;
use std::fmt;
use std::time::Duration;

/// The part of the run a finding came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Rollback, idempotency and ledger checks of one migration.
    Migration { version: i64 },
    /// Forward application of the whole chain on a fresh database.
    FullChain { version: i64 },
    Integrity,
    TimeSeries,
    TransactionProbe,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Migration { version } => write!(f, "migration {version}"),
            Phase::FullChain { version } => write!(f, "full chain, migration {version}"),
            Phase::Integrity => f.write_str("integrity"),
            Phase::TimeSeries => f.write_str("time-series"),
            Phase::TransactionProbe => f.write_str("transaction probe"),
        }
    }
}

#[derive(Debug)]
pub struct Failure {
    pub phase: Phase,
    pub error: VerifyError,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.error)
    }
}

#[derive(Debug, Default)]
pub struct VerificationReport {
    failures: Vec<Failure>,
    conflicts: Vec<ConflictReport>,
    passed: Vec<String>,
    migrations: usize,
    elapsed: Duration,
}

impl VerificationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, phase: Phase, error: VerifyError) {
        let failure = Failure { phase, error };
        log::error!("{failure}");
        self.failures.push(failure);
    }

    pub fn record_pass(&mut self, check: impl Into<String>) {
        let check = check.into();
        log::debug!("passed: {check}");
        self.passed.push(check);
    }

    pub fn set_conflicts(&mut self, conflicts: Vec<ConflictReport>) {
        self.conflicts = conflicts;
    }

    pub(crate) fn set_migration_count(&mut self, migrations: usize) {
        self.migrations = migrations;
    }

    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        log::info!(
            "verified {} migration(s) in {:.2}s: {} check(s) passed, {} failure(s), {} conflict(s)",
            self.migrations,
            elapsed.as_secs_f64(),
            self.passed.len(),
            self.failures.len(),
            self.conflicts.len()
        );
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Advisory: tables touched by more than one migration.
    pub fn conflicts(&self) -> &[ConflictReport] {
        &self.conflicts
    }

    pub fn passed(&self) -> &[String] {
        &self.passed
    }

    pub fn migration_count(&self) -> usize {
        self.migrations
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Conflicts do not count against success.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures whose error matches `predicate`.
    pub fn failures_matching(&self, predicate: impl Fn(&VerifyError) -> bool) -> Vec<&Failure> {
        self.failures.iter().filter(|f| predicate(&f.error)).collect()
    }

    /// Panic with every failure message unless the run succeeded.
    ///
    /// Meant to be the last line of a `#[test]`.
    #[track_caller]
    pub fn assert_passed(&self) {
        if !self.is_success() {
            panic!("migration verification failed\n{self}");
        }
    }

    pub fn into_result(self) -> Result<Self, Vec<Failure>> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.failures)
        }
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} migration(s), {} check(s) passed, {} failure(s) in {:.2}s",
            self.migrations,
            self.passed.len(),
            self.failures.len(),
            self.elapsed.as_secs_f64()
        )?;
        for failure in &self.failures {
            writeln!(f, "FAIL {failure}")?;
        }
        for conflict in &self.conflicts {
            writeln!(f, "WARN {conflict}")?;
        }
        Ok(())
    }
}
