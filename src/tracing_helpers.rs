//! `tracing` spans for the verification run (feature `tracing`).

use tracing::{info_span, Span};

/// Longest statement prefix recorded on a span.
const STATEMENT_PREVIEW: usize = 120;

fn preview(sql: &str) -> &str {
    let trimmed = sql.trim_start();
    match trimmed.char_indices().nth(STATEMENT_PREVIEW) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

pub fn execute_query_span(sql: &str) -> Span {
    info_span!("tidewatch.execute", db.statement = preview(sql))
}

pub fn begin_transaction_span() -> Span {
    info_span!("tidewatch.transaction.begin")
}

pub fn rollback_transaction_span() -> Span {
    info_span!("tidewatch.transaction.rollback")
}

pub fn migration_span(version: i64, name: &str) -> Span {
    info_span!("tidewatch.migration", migration.version = version, migration.name = name)
}

pub fn phase_span(phase: &'static str) -> Span {
    info_span!("tidewatch.phase", phase = phase)
}

pub fn capture_span(kind: &'static str) -> Span {
    info_span!("tidewatch.capture", kind = kind)
}
