//! The verification steps run against a provisioned database.
//!
//! Each step records findings in the [`RunContext`] and only returns `Err`
//! for lifecycle violations; database errors become `SqlExecution` findings.

use super::report::Phase;
use super::state::RunState;
use super::RunContext;
use crate::config::{MigrationSettings, VerifierConfig};
use crate::error::{Error, VerifyError};
use crate::executor::{quote_ident, DbError, Executor};
use crate::integrity::{check_orphans, check_preservation, check_primary_keys};
use crate::migration::ledger::{applied_versions, find_record, record_migration, remove_migration_record};
use crate::migration::{LedgerRecord, MigrationAnnotations, MigrationPair};
use crate::snapshot::{capture_data, capture_schema, SchemaSnapshot};
use crate::timeseries::{capture_catalog, extension_installed, validate, TimeSeriesCatalog};
use crate::transaction::run_in_transaction;
use chrono::Utc;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

const PROBE_TABLE: &str = "tidewatch_transaction_probe";

/// Run `script` inside `BEGIN`/`COMMIT` unless annotated `no-transaction`.
fn apply_script(db: &dyn Executor, script: &str, transactional: bool) -> Result<(), DbError> {
    if transactional {
        run_in_transaction(db, script)
    } else {
        db.batch_execute(script)
    }
}

fn apply_forward(db: &dyn Executor, pair: &MigrationPair) -> Result<i64, DbError> {
    let start = Instant::now();
    apply_script(db, &pair.up_script, pair.annotations.transactional)?;
    Ok(start.elapsed().as_millis() as i64)
}

fn apply_backward(db: &dyn Executor, pair: &MigrationPair) -> Result<(), DbError> {
    let transactional = MigrationAnnotations::parse(&pair.down_script).transactional;
    apply_script(db, &pair.down_script, transactional)
}

fn record(db: &dyn Executor, ledger: &str, pair: &MigrationPair, elapsed_ms: i64) -> Result<(), DbError> {
    let record = LedgerRecord::new(
        pair.version,
        pair.name.clone(),
        pair.checksum.clone(),
        Utc::now(),
        Some(elapsed_ms),
    );
    record_migration(db, ledger, &record)
}

/// Findings for a ledger that should hold exactly `pair`'s record.
fn ledger_holds(db: &dyn Executor, ledger: &str, pair: &MigrationPair) -> Result<Option<VerifyError>, DbError> {
    let mismatch = |detail: String| VerifyError::LedgerMismatch {
        version: pair.version,
        detail,
    };
    Ok(match find_record(db, ledger, pair.version)? {
        None => Some(mismatch("no ledger record after forward script".to_string())),
        Some(record) if record.checksum != pair.checksum => Some(mismatch(format!(
            "recorded checksum {} does not match {}",
            record.checksum, pair.checksum
        ))),
        Some(record) if record.name != pair.name => Some(mismatch(format!(
            "recorded name '{}' does not match '{}'",
            record.name, pair.name
        ))),
        Some(_) => None,
    })
}

/// Rollback symmetry, ledger bookkeeping and idempotency of one migration.
///
/// Leaves the migration applied and recorded so the next one builds on it.
pub(crate) fn migration_cycle(
    db: &dyn Executor,
    settings: &MigrationSettings,
    run: &mut RunContext,
    pair: &MigrationPair,
) -> Result<(), Error> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::migration_span(pair.version, &pair.name).entered();

    let phase = Phase::Migration {
        version: pair.version,
    };
    let schema = settings.schema.as_str();
    let ledger = settings.ledger_table.as_str();
    log::info!("verifying {pair}");

    run.advance(RunState::SnapshotBefore)?;
    let before = match capture_schema(db, schema) {
        Ok(snapshot) => snapshot,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("capturing schema before {pair}"), &e)),
    };

    run.advance(RunState::ApplyUp)?;
    let elapsed_ms = match apply_forward(db, pair) {
        Ok(ms) => ms,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("forward script of {pair}"), &e)),
    };
    if let Err(e) = record(db, ledger, pair, elapsed_ms) {
        return run.abandon(phase, VerifyError::sql(format!("recording {pair} in the ledger"), &e));
    }

    run.advance(RunState::Verify)?;
    match ledger_holds(db, ledger, pair) {
        Ok(None) => run.pass(format!("ledger records {pair}")),
        Ok(Some(mismatch)) => run.fail(phase, mismatch),
        Err(e) => run.fail(phase, VerifyError::sql(format!("reading the ledger for {pair}"), &e)),
    }

    run.advance(RunState::ApplyDown)?;
    if let Err(e) = apply_backward(db, pair) {
        return run.abandon(phase, VerifyError::sql(format!("backward script of {pair}"), &e));
    }
    match remove_migration_record(db, ledger, pair.version) {
        Ok(true) => {}
        Ok(false) => run.fail(
            phase,
            VerifyError::LedgerMismatch {
                version: pair.version,
                detail: "no ledger record to remove after backward script".to_string(),
            },
        ),
        Err(e) => run.fail(phase, VerifyError::sql(format!("removing {pair} from the ledger"), &e)),
    }

    run.advance(RunState::VerifyRollback)?;
    match find_record(db, ledger, pair.version) {
        Ok(None) => {}
        Ok(Some(_)) => run.fail(
            phase,
            VerifyError::LedgerMismatch {
                version: pair.version,
                detail: "ledger record still present after backward script".to_string(),
            },
        ),
        Err(e) => run.fail(phase, VerifyError::sql(format!("reading the ledger for {pair}"), &e)),
    }
    match capture_schema(db, schema) {
        Ok(after) if after == before => run.pass(format!("rollback symmetry of {pair}")),
        Ok(after) => run.fail(
            phase,
            VerifyError::SchemaDrift {
                migration: pair.to_string(),
                diff: before.diff(&after),
            },
        ),
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("capturing schema after rolling back {pair}"), &e)),
    }

    run.advance(RunState::ApplyUp)?;
    let elapsed_ms = match apply_forward(db, pair) {
        Ok(ms) => ms,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("re-applying forward script of {pair}"), &e)),
    };
    let once = match capture_schema(db, schema) {
        Ok(snapshot) => snapshot,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("capturing schema after {pair}"), &e)),
    };
    let second = apply_forward(db, pair);

    run.advance(RunState::Verify)?;
    match second {
        Ok(_) => check_idempotent(db, schema, run, pair, &once),
        Err(e) => run.fail(
            phase,
            VerifyError::sql(format!("second application of forward script of {pair} (idempotency)"), &e),
        ),
    }
    if let Err(e) = record(db, ledger, pair, elapsed_ms) {
        run.fail(phase, VerifyError::sql(format!("recording {pair} in the ledger"), &e));
    }

    run.advance(RunState::Ready)
}

/// `None` when applying the forward script a second time changed nothing.
fn idempotency_finding(
    pair: &MigrationPair,
    once: &SchemaSnapshot,
    twice: &SchemaSnapshot,
) -> Option<VerifyError> {
    (once != twice).then(|| VerifyError::NonIdempotentMigration {
        migration: pair.to_string(),
        diff: once.diff(twice),
    })
}

fn check_idempotent(
    db: &dyn Executor,
    schema: &str,
    run: &mut RunContext,
    pair: &MigrationPair,
    once: &SchemaSnapshot,
) {
    let phase = Phase::Migration {
        version: pair.version,
    };
    match capture_schema(db, schema) {
        Ok(twice) => match idempotency_finding(pair, once, &twice) {
            None => run.pass(format!("idempotency of {pair}")),
            Some(finding) => run.fail(phase, finding),
        },
        Err(e) => run.fail(
            phase,
            VerifyError::sql(format!("capturing schema after applying {pair} twice"), &e),
        ),
    }
}

/// Forward-apply one migration of the full chain, then run its seed.
///
/// Row counts are compared before the seed runs so inserted seed rows cannot
/// mask a decrease.
pub(crate) fn chain_step(
    db: &dyn Executor,
    settings: &MigrationSettings,
    run: &mut RunContext,
    pair: &MigrationPair,
) -> Result<(), Error> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::migration_span(pair.version, &pair.name).entered();

    let phase = Phase::FullChain {
        version: pair.version,
    };
    let schema = settings.schema.as_str();

    run.advance(RunState::SnapshotBefore)?;
    let before = match capture_data(db, schema) {
        Ok(snapshot) => snapshot,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("counting rows before {pair}"), &e)),
    };

    run.advance(RunState::ApplyUp)?;
    let elapsed_ms = match apply_forward(db, pair) {
        Ok(ms) => ms,
        Err(e) => return run.abandon(phase, VerifyError::sql(format!("forward script of {pair}"), &e)),
    };
    if let Err(e) = record(db, &settings.ledger_table, pair, elapsed_ms) {
        run.fail(phase, VerifyError::sql(format!("recording {pair} in the ledger"), &e));
    }

    run.advance(RunState::Verify)?;
    match capture_data(db, schema) {
        Ok(after) => {
            let losses = check_preservation(pair, &before, &after);
            if losses.is_empty() {
                run.pass(format!("row counts preserved by {pair}"));
            }
            for loss in losses {
                run.fail(phase, loss);
            }
        }
        Err(e) => run.fail(phase, VerifyError::sql(format!("counting rows after {pair}"), &e)),
    }

    if let Some(seed) = &pair.seed_script {
        match run_in_transaction(db, seed) {
            Ok(()) => log::debug!("seeded {pair}"),
            Err(e) => run.fail(phase, VerifyError::sql(format!("seed script of {pair}"), &e)),
        }
    }

    run.advance(RunState::Ready)
}

/// Versions the ledger should hold but does not, and versions it holds that
/// were never discovered.
fn ledger_gaps(expected: &[i64], applied: &[i64]) -> Vec<(i64, &'static str)> {
    let missing = expected
        .iter()
        .filter(|v| !applied.contains(v))
        .map(|&v| (v, "missing from the ledger after the full chain"));
    let unknown = applied
        .iter()
        .filter(|v| !expected.contains(v))
        .map(|&v| (v, "recorded in the ledger but not discovered"));
    missing.chain(unknown).collect()
}

/// After the full chain the ledger must list every migration that applied.
///
/// Migrations already reported as failed in the chain are not expected.
pub(crate) fn ledger_complete(
    db: &dyn Executor,
    settings: &MigrationSettings,
    run: &mut RunContext,
    pairs: &[MigrationPair],
) {
    let expected: Vec<i64> = pairs
        .iter()
        .map(|p| p.version)
        .filter(|&version| !run.has_failed(Phase::FullChain { version }))
        .collect();
    let applied = match applied_versions(db, &settings.ledger_table) {
        Ok(versions) => versions,
        Err(e) => {
            let version = pairs.last().map_or(0, |p| p.version);
            return run.fail(
                Phase::FullChain { version },
                VerifyError::sql("reading the ledger after the full chain", &e),
            );
        }
    };

    let gaps = ledger_gaps(&expected, &applied);
    if gaps.is_empty() {
        run.pass(format!("ledger lists all {} applied migration(s)", applied.len()));
    }
    for (version, detail) in gaps {
        run.fail(
            Phase::FullChain { version },
            VerifyError::LedgerMismatch {
                version,
                detail: detail.to_string(),
            },
        );
    }
}

/// Orphans and primary-key coverage of the fully migrated schema.
pub(crate) fn integrity(db: &dyn Executor, settings: &MigrationSettings, run: &mut RunContext) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::phase_span("integrity").entered();

    let schema = settings.schema.as_str();
    match capture_schema(db, schema) {
        Ok(snapshot) => {
            let missing = check_primary_keys(&snapshot);
            if missing.is_empty() {
                run.pass("every base table has a primary key");
            }
            for failure in missing {
                run.fail(Phase::Integrity, failure);
            }
        }
        Err(e) => run.fail(Phase::Integrity, VerifyError::sql("capturing the migrated schema", &e)),
    }

    match check_orphans(db, schema) {
        Ok(result) => {
            let checked = result.relationships.len();
            match result.into_failure() {
                Some(failure) => run.fail(Phase::Integrity, failure),
                None => run.pass(format!("no orphaned rows across {checked} foreign key(s)")),
            }
        }
        Err(e) => run.fail(Phase::Integrity, VerifyError::sql("counting orphaned rows", &e)),
    }
}

/// Time-series features of the fully migrated schema.
pub(crate) fn time_series(db: &dyn Executor, config: &VerifierConfig, run: &mut RunContext) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::phase_span("timeseries").entered();

    let captured = match extension_installed(db) {
        Ok(true) => capture_catalog(db, &config.migrations.schema),
        Ok(false) => {
            log::warn!("timescaledb extension is not installed");
            Ok(TimeSeriesCatalog::default())
        }
        Err(e) => Err(e),
    };
    match captured {
        Ok(catalog) => {
            let failures = validate(&catalog, &config.timeseries);
            if failures.is_empty() {
                run.pass(format!(
                    "time-series features ({} hypertable(s), {} continuous aggregate(s))",
                    catalog.hypertables.len(),
                    catalog.continuous_aggregates.len()
                ));
            }
            for failure in failures {
                run.fail(Phase::TimeSeries, failure);
            }
        }
        Err(e) => run.fail(Phase::TimeSeries, VerifyError::sql("reading the timescaledb catalog", &e)),
    }
}

/// Script that creates a table and then fails at execution time.
///
/// The error must come from execution, not parsing: a syntax error rejects the
/// whole script before anything runs.
pub fn probe_script() -> String {
    format!(
        "CREATE TABLE {} (id INT);\nSELECT 1 / 0;",
        quote_ident(PROBE_TABLE)
    )
}

/// A failing transactional script must leave no schema changes behind.
pub(crate) fn transaction_probe(db: &dyn Executor, settings: &MigrationSettings, run: &mut RunContext) {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::phase_span("transaction_probe").entered();

    let schema = settings.schema.as_str();
    let phase = Phase::TransactionProbe;
    let before = match capture_schema(db, schema) {
        Ok(snapshot) => snapshot,
        Err(e) => return run.fail(phase, VerifyError::sql("capturing schema before the probe", &e)),
    };

    match run_in_transaction(db, &probe_script()) {
        Ok(()) => {
            run.fail(
                phase,
                VerifyError::SqlExecution {
                    context: "transaction probe".to_string(),
                    error: "failing script reported success".to_string(),
                },
            );
            let _ = db.batch_execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(PROBE_TABLE)));
        }
        Err(e) => {
            log::debug!("probe script failed as intended: {e}");
            match capture_schema(db, schema) {
                Ok(after) if after == before => run.pass("failed transactional script left no changes"),
                Ok(after) => run.fail(
                    phase,
                    VerifyError::TransactionLeak {
                        diff: before.diff(&after),
                    },
                ),
                Err(e) => run.fail(phase, VerifyError::sql("capturing schema after the probe", &e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::schema::tests::companies_snapshot;
    use crate::snapshot::IndexDef;

    fn lookup_index(name: &str) -> IndexDef {
        IndexDef {
            table: "companies".to_string(),
            name: name.to_string(),
            definition: format!("CREATE INDEX {name} ON public.companies USING btree (id, name)"),
        }
    }

    #[test]
    fn test_second_application_adding_an_index_is_not_idempotent() {
        let pair = MigrationPair::new(
            4,
            "index_company_lookup",
            "CREATE INDEX ON companies (id, name);",
            "DROP INDEX IF EXISTS companies_id_name_idx;",
        );
        let mut once = companies_snapshot();
        once.indexes.insert(lookup_index("companies_id_name_idx"));
        let mut twice = once.clone();
        twice.indexes.insert(lookup_index("companies_id_name_idx1"));

        let finding = idempotency_finding(&pair, &once, &twice).unwrap();
        assert!(matches!(finding, VerifyError::NonIdempotentMigration { .. }));
        let msg = finding.to_string();
        assert!(msg.contains("004_index_company_lookup (version 4)"));
        assert!(msg.contains("+ index companies_id_name_idx1 on companies"));
        assert!(!msg.contains("+ index companies_id_name_idx on"));

        assert!(idempotency_finding(&pair, &once, &once.clone()).is_none());
    }

    #[test]
    fn test_ledger_gaps() {
        assert!(ledger_gaps(&[1, 2, 3], &[1, 2, 3]).is_empty());
        assert_eq!(
            ledger_gaps(&[1, 2, 3], &[1, 3, 9]),
            vec![
                (2, "missing from the ledger after the full chain"),
                (9, "recorded in the ledger but not discovered"),
            ]
        );
    }

    #[test]
    fn test_probe_script_fails_at_execution() {
        let script = probe_script();
        assert!(script.starts_with("CREATE TABLE \"tidewatch_transaction_probe\" (id INT);"));
        assert!(script.ends_with("SELECT 1 / 0;"));
    }
}
