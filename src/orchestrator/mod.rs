//! Verification run orchestration.
//!
//! An [`Orchestrator`] owns the configuration, the administrative connection
//! and the connection to an isolated test database. A run:
//!
//! 1. discovers migrations and scans them for conflicts (no database access);
//! 2. recreates the test database, enables `timescaledb`, creates the ledger;
//! 3. checks every migration for rollback symmetry, ledger bookkeeping and
//!    idempotency, leaving each applied for the next;
//! 4. recreates the database and applies the full chain with seeds, checking
//!    row-count preservation around each migration and that the ledger lists
//!    every applied migration;
//! 5. checks orphans, primary keys and time-series features of the result;
//! 6. probes that a failing transactional script leaves no changes;
//! 7. drops the test database.
//!
//! Findings accumulate in a [`VerificationReport`]; only setup failures abort.
//!
//! ```rust,no_run
//! use tidewatch::{Orchestrator, VerifierConfig};
//!
//! let report = Orchestrator::new(VerifierConfig::load()?).run()?;
//! report.assert_passed();
//! # Ok::<(), tidewatch::Error>(())
//! ```

mod checks;
pub mod database;
pub mod report;
pub mod state;

pub use checks::probe_script;
pub use report::{Failure, Phase, VerificationReport};
pub use state::{RunState, StateMachine};

use crate::config::VerifierConfig;
use crate::conflict::detect_conflicts;
use crate::connection::connect_to;
use crate::error::{Error, VerifyError};
use crate::executor::{Executor, MayPostgresExecutor};
use crate::migration::{discover_migrations, initialize_ledger, MigrationPair};
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// Mutable state of one run: lifecycle, findings and the budget clock.
pub(crate) struct RunContext {
    machine: StateMachine,
    report: VerificationReport,
    started: Instant,
    budget: Duration,
    budget_exhausted: bool,
}

impl RunContext {
    fn new(budget: Duration) -> Self {
        Self {
            machine: StateMachine::new(),
            report: VerificationReport::new(),
            started: Instant::now(),
            budget,
            budget_exhausted: false,
        }
    }

    /// Restart the budget clock; called when the run begins.
    fn start(&mut self) {
        self.started = Instant::now();
    }

    pub(crate) fn has_failed(&self, phase: Phase) -> bool {
        self.report.failures().iter().any(|f| f.phase == phase)
    }

    pub(crate) fn advance(&mut self, next: RunState) -> Result<(), Error> {
        self.machine.advance(next)
    }

    pub(crate) fn fail(&mut self, phase: Phase, error: VerifyError) {
        self.report.record_failure(phase, error);
    }

    pub(crate) fn pass(&mut self, check: impl Into<String>) {
        self.report.record_pass(check);
    }

    /// Record `error` and return to `Ready`, skipping the rest of the step.
    pub(crate) fn abandon(&mut self, phase: Phase, error: VerifyError) -> Result<(), Error> {
        self.fail(phase, error);
        self.advance(RunState::Ready)
    }

    /// `false` once the budget is spent; the first overrun is recorded.
    pub(crate) fn within_budget(&mut self, phase: Phase, step: &str) -> bool {
        if self.budget_exhausted {
            return false;
        }
        let elapsed = self.started.elapsed();
        if elapsed <= self.budget {
            return true;
        }
        self.budget_exhausted = true;
        self.fail(
            phase,
            VerifyError::BudgetExceeded {
                budget: self.budget,
                elapsed,
                step: step.to_string(),
            },
        );
        false
    }

    fn finish(mut self) -> VerificationReport {
        self.report.finish(self.started.elapsed());
        self.report
    }
}

/// Drives one verification run against an isolated test database.
pub struct Orchestrator {
    config: VerifierConfig,
    run: RunContext,
}

impl Orchestrator {
    pub fn new(config: VerifierConfig) -> Self {
        let budget = config.run.budget();
        Self {
            config,
            run: RunContext::new(budget),
        }
    }

    /// Build from `config/tidewatch.toml` and `TIDEWATCH__*` variables.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self::new(VerifierConfig::load()?))
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.run.machine.current()
    }

    /// Execute the whole run.
    ///
    /// Discovery errors abort before the database is touched. Once the test
    /// database exists it is torn down even when a later step aborts, and the
    /// findings recorded so far come back inside [`Error::Aborted`].
    pub fn run(mut self) -> Result<VerificationReport, Error> {
        self.run.start();
        let dir = self.config.migrations.directory.clone();
        log::info!("discovering migrations in {}", dir.display());
        let pairs = discover_migrations(&dir)?;
        let conflicts = detect_conflicts(&pairs)?;
        self.run.report.set_migration_count(pairs.len());
        self.run.report.set_conflicts(conflicts);

        let db = &self.config.database;
        let admin = MayPostgresExecutor::new(connect_to(db, &db.admin_database)?);

        let outcome = self.verify(&admin, &pairs);
        let teardown = self.tear_down(&admin);
        let report = self.run.finish();
        match outcome.and(teardown) {
            Ok(()) => Ok(report),
            Err(cause) => Err(Error::aborted(cause, report)),
        }
    }

    fn verify(&mut self, admin: &MayPostgresExecutor, pairs: &[MigrationPair]) -> Result<(), Error> {
        {
            #[cfg(feature = "tracing")]
            let _span = tracing_helpers::phase_span("migrations").entered();

            let db = self.provision(admin)?;
            for pair in pairs {
                let phase = Phase::Migration {
                    version: pair.version,
                };
                if !self.run.within_budget(phase, &format!("verifying {pair}")) {
                    return Ok(());
                }
                checks::migration_cycle(&db, &self.config.migrations, &mut self.run, pair)?;
            }
        }

        let Some(first) = pairs.first() else {
            log::warn!("no migrations found; skipping full-chain checks");
            return Ok(());
        };
        if !self.run.within_budget(Phase::FullChain { version: first.version }, "full-chain setup") {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::phase_span("full_chain").entered();

        self.run.advance(RunState::DatabaseProvisioned)?;
        let db = self.provision(admin)?;
        for pair in pairs {
            let phase = Phase::FullChain {
                version: pair.version,
            };
            if !self.run.within_budget(phase, &format!("applying {pair} in the full chain")) {
                return Ok(());
            }
            checks::chain_step(&db, &self.config.migrations, &mut self.run, pair)?;
        }
        checks::ledger_complete(&db, &self.config.migrations, &mut self.run, pairs);

        if !self.run.within_budget(Phase::Integrity, "integrity checks") {
            return Ok(());
        }
        checks::integrity(&db, &self.config.migrations, &mut self.run);

        if !self.run.within_budget(Phase::TimeSeries, "time-series checks") {
            return Ok(());
        }
        if self.config.run.enable_extension || !self.config.timeseries.is_empty() {
            checks::time_series(&db, &self.config, &mut self.run);
        }

        if self.config.run.failure_probe
            && self.run.within_budget(Phase::TransactionProbe, "transaction probe")
        {
            checks::transaction_probe(&db, &self.config.migrations, &mut self.run);
        }
        Ok(())
    }

    /// Recreate the test database and connect to it; ends in `Ready`.
    fn provision(&mut self, admin: &MayPostgresExecutor) -> Result<MayPostgresExecutor, Error> {
        let settings = &self.config.database;
        let name = settings.test_database.as_str();

        database::recreate_database(admin, name)
            .map_err(Error::database(format!("recreating test database '{name}'")))?;
        if self.run.machine.current() == RunState::Uninitialized {
            self.run.advance(RunState::DatabaseProvisioned)?;
        }

        let db = MayPostgresExecutor::new(connect_to(settings, name)?);
        database::set_statement_timeout(&db, self.config.run.statement_timeout_seconds)
            .map_err(Error::database("setting statement_timeout"))?;

        if self.config.run.enable_extension {
            database::enable_extension(&db).map_err(Error::database("creating the timescaledb extension"))?;
            self.run.advance(RunState::ExtensionEnabled)?;
        }

        let schema = self.config.migrations.schema.as_str();
        database::ensure_schema(&db, schema)
            .map_err(Error::database(format!("creating schema '{schema}'")))?;
        db.batch_execute(&database::search_path_sql(schema))
            .map_err(Error::database("setting search_path"))?;
        initialize_ledger(&db, &self.config.migrations.ledger_table)
            .map_err(Error::database("creating the ledger table"))?;

        self.run.advance(RunState::Ready)?;
        Ok(db)
    }

    fn tear_down(&mut self, admin: &MayPostgresExecutor) -> Result<(), Error> {
        self.run.advance(RunState::TearDown)?;
        let name = self.config.database.test_database.as_str();
        if self.config.run.keep_database {
            log::info!("keeping test database {name}");
            return Ok(());
        }
        database::drop_database(admin, name)
            .map_err(Error::database(format!("dropping test database '{name}'")))?;
        log::info!("dropped test database {name}");
        Ok(())
    }
}

/// Load configuration from the environment and run a full verification.
pub fn verify_migrations() -> Result<VerificationReport, Error> {
    Orchestrator::from_env()?.run()
}
