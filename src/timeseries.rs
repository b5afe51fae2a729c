//! TimescaleDB feature validation.
//!
//! The catalog is captured once ([`capture_catalog`]) and then checked
//! against the configured [`TimeSeriesExpectations`] by the pure
//! [`validate`] function. All checks are assertions over catalog state.

use crate::error::VerifyError;
use crate::executor::{DbError, Executor};
use serde::Deserialize;
use std::fmt;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

const COMPRESSION_PROC: &str = "policy_compression";
const RETENTION_PROC: &str = "policy_retention";

/// What the fully migrated schema must provide.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimeSeriesExpectations {
    /// Tables that must be registered hypertables.
    #[serde(default)]
    pub hypertables: Vec<String>,
    /// Hypertables that must carry a compression policy.
    #[serde(default)]
    pub compressed: Vec<String>,
    /// Hypertables that must carry a retention policy.
    #[serde(default)]
    pub retained: Vec<String>,
    /// At least one continuous aggregate must exist.
    #[serde(default)]
    pub require_continuous_aggregate: bool,
}

impl TimeSeriesExpectations {
    pub fn is_empty(&self) -> bool {
        self.hypertables.is_empty()
            && self.compressed.is_empty()
            && self.retained.is_empty()
            && !self.require_continuous_aggregate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSeriesFeature {
    Extension,
    Hypertable,
    CompressionPolicy,
    RetentionPolicy,
    ContinuousAggregate,
    ChunkInterval,
}

impl fmt::Display for TimeSeriesFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeSeriesFeature::Extension => "extension",
            TimeSeriesFeature::Hypertable => "hypertable",
            TimeSeriesFeature::CompressionPolicy => "compression policy",
            TimeSeriesFeature::RetentionPolicy => "retention policy",
            TimeSeriesFeature::ContinuousAggregate => "continuous aggregate",
            TimeSeriesFeature::ChunkInterval => "chunk interval",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HypertableInfo {
    pub name: String,
    pub compression_enabled: bool,
}

/// A background job attached to a hypertable.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyJob {
    pub job_id: i32,
    pub proc_name: String,
    pub hypertable: Option<String>,
    pub compress_after: Option<String>,
    pub drop_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinuousAggregateInfo {
    pub view_name: String,
    pub materialization_table: Option<String>,
    /// The materialization hypertable resolves to an existing relation.
    pub materialization_exists: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionKind {
    Time,
    Space,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionInfo {
    pub hypertable: String,
    pub column: String,
    pub kind: DimensionKind,
    /// Interval as rendered by PostgreSQL, e.g. `7 days`.
    pub time_interval: Option<String>,
    pub interval_seconds: Option<f64>,
    /// Chunk size for integer time columns.
    pub integer_interval: Option<i64>,
    pub num_partitions: Option<i64>,
}

impl DimensionInfo {
    fn chunk_interval_is_set(&self) -> bool {
        self.interval_seconds.is_some_and(|s| s > 0.0) || self.integer_interval.is_some_and(|i| i > 0)
    }
}

/// TimescaleDB catalog state for one schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeriesCatalog {
    /// `None` when the extension is not installed.
    pub extension_version: Option<String>,
    pub hypertables: Vec<HypertableInfo>,
    pub jobs: Vec<PolicyJob>,
    pub continuous_aggregates: Vec<ContinuousAggregateInfo>,
    pub dimensions: Vec<DimensionInfo>,
}

impl TimeSeriesCatalog {
    pub fn hypertable(&self, name: &str) -> Option<&HypertableInfo> {
        self.hypertables.iter().find(|h| h.name == name)
    }

    fn policy(&self, proc_name: &str, table: &str) -> Option<&PolicyJob> {
        self.jobs
            .iter()
            .find(|j| j.proc_name == proc_name && j.hypertable.as_deref() == Some(table))
    }
}

const EXTENSION_SQL: &str = "SELECT extversion::text FROM pg_extension WHERE extname = 'timescaledb'";

const HYPERTABLES_SQL: &str = r#"
    SELECT hypertable_name::text, compression_enabled
    FROM timescaledb_information.hypertables
    WHERE hypertable_schema = $1
"#;

const JOBS_SQL: &str = r#"
    SELECT job_id,
           proc_name::text,
           hypertable_name::text,
           COALESCE(config->>'compress_after', config->>'compress_created_before'),
           COALESCE(config->>'drop_after', config->>'drop_created_before')
    FROM timescaledb_information.jobs
    WHERE hypertable_schema = $1
"#;

const CONTINUOUS_AGGREGATES_SQL: &str = r#"
    SELECT view_name::text,
           materialization_hypertable_name::text,
           CASE WHEN materialization_hypertable_name IS NULL THEN false
                ELSE to_regclass(format('%I.%I', materialization_hypertable_schema,
                                        materialization_hypertable_name)) IS NOT NULL
           END
    FROM timescaledb_information.continuous_aggregates
    WHERE view_schema = $1
"#;

const DIMENSIONS_SQL: &str = r#"
    SELECT hypertable_name::text,
           column_name::text,
           dimension_type::text,
           time_interval::text,
           EXTRACT(EPOCH FROM time_interval)::float8,
           integer_interval::bigint,
           num_partitions::bigint
    FROM timescaledb_information.dimensions
    WHERE hypertable_schema = $1
"#;

/// Whether the `timescaledb` extension is installed in the connected database.
pub fn extension_installed(executor: &dyn Executor) -> Result<bool, DbError> {
    Ok(!executor.query_all(EXTENSION_SQL, &[])?.is_empty())
}

/// Read hypertables, jobs, continuous aggregates and dimensions of `schema`.
pub fn capture_catalog(executor: &dyn Executor, schema: &str) -> Result<TimeSeriesCatalog, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::capture_span("timeseries").entered();

    let extension_version = executor
        .query_all(EXTENSION_SQL, &[])?
        .first()
        .map(|row| row.get::<_, String>(0));
    if extension_version.is_none() {
        return Ok(TimeSeriesCatalog::default());
    }

    let hypertables = executor
        .query_all(HYPERTABLES_SQL, &[&schema])?
        .iter()
        .map(|row| HypertableInfo {
            name: row.get(0),
            compression_enabled: row.get::<_, Option<bool>>(1).unwrap_or(false),
        })
        .collect();

    let jobs = executor
        .query_all(JOBS_SQL, &[&schema])?
        .iter()
        .map(|row| PolicyJob {
            job_id: row.get(0),
            proc_name: row.get(1),
            hypertable: row.get(2),
            compress_after: row.get(3),
            drop_after: row.get(4),
        })
        .collect();

    let continuous_aggregates = executor
        .query_all(CONTINUOUS_AGGREGATES_SQL, &[&schema])?
        .iter()
        .map(|row| ContinuousAggregateInfo {
            view_name: row.get(0),
            materialization_table: row.get(1),
            materialization_exists: row.get(2),
        })
        .collect();

    let dimensions = executor
        .query_all(DIMENSIONS_SQL, &[&schema])?
        .iter()
        .map(|row| DimensionInfo {
            hypertable: row.get(0),
            column: row.get(1),
            kind: if row.get::<_, String>(2).eq_ignore_ascii_case("space") {
                DimensionKind::Space
            } else {
                DimensionKind::Time
            },
            time_interval: row.get(3),
            interval_seconds: row.get(4),
            integer_interval: row.get(5),
            num_partitions: row.get(6),
        })
        .collect();

    Ok(TimeSeriesCatalog {
        extension_version,
        hypertables,
        jobs,
        continuous_aggregates,
        dimensions,
    })
}

fn missing(feature: TimeSeriesFeature, detail: String) -> VerifyError {
    VerifyError::TimeSeriesFeatureMissing { feature, detail }
}

/// Check `catalog` against `expectations`; one failure per missing or
/// malformed feature.
pub fn validate(catalog: &TimeSeriesCatalog, expectations: &TimeSeriesExpectations) -> Vec<VerifyError> {
    let mut failures = Vec::new();

    if catalog.extension_version.is_none() {
        let classes = [
            (!expectations.hypertables.is_empty(), "hypertables"),
            (!expectations.compressed.is_empty(), "compression policies"),
            (!expectations.retained.is_empty(), "retention policies"),
            (expectations.require_continuous_aggregate, "continuous aggregates"),
        ];
        for (_, class) in classes.iter().filter(|(expected, _)| *expected) {
            failures.push(missing(
                TimeSeriesFeature::Extension,
                format!("timescaledb extension is not installed; cannot verify {class}"),
            ));
        }
        return failures;
    }

    for table in &expectations.hypertables {
        if catalog.hypertable(table).is_none() {
            failures.push(missing(
                TimeSeriesFeature::Hypertable,
                format!("expected hypertable '{table}' is not registered"),
            ));
        }
    }

    for table in &expectations.compressed {
        match catalog.policy(COMPRESSION_PROC, table) {
            None => failures.push(missing(
                TimeSeriesFeature::CompressionPolicy,
                format!("no compression policy job for '{table}'"),
            )),
            Some(job) if job.compress_after.is_none() => failures.push(missing(
                TimeSeriesFeature::CompressionPolicy,
                format!("compression job {} for '{table}' has no compress_after interval", job.job_id),
            )),
            Some(_) => {}
        }
        if let Some(hypertable) = catalog.hypertable(table) {
            if !hypertable.compression_enabled {
                failures.push(missing(
                    TimeSeriesFeature::CompressionPolicy,
                    format!("compression is not enabled on hypertable '{table}'"),
                ));
            }
        }
    }

    for table in &expectations.retained {
        match catalog.policy(RETENTION_PROC, table) {
            None => failures.push(missing(
                TimeSeriesFeature::RetentionPolicy,
                format!("no retention policy job for '{table}'"),
            )),
            Some(job) if job.drop_after.is_none() => failures.push(missing(
                TimeSeriesFeature::RetentionPolicy,
                format!("retention job {} for '{table}' has no drop_after interval", job.job_id),
            )),
            Some(_) => {}
        }
    }

    if expectations.require_continuous_aggregate && catalog.continuous_aggregates.is_empty() {
        failures.push(missing(
            TimeSeriesFeature::ContinuousAggregate,
            "no continuous aggregate is registered".to_string(),
        ));
    }
    for cagg in &catalog.continuous_aggregates {
        if cagg.materialization_table.is_none() || !cagg.materialization_exists {
            failures.push(missing(
                TimeSeriesFeature::ContinuousAggregate,
                format!(
                    "continuous aggregate '{}' is not linked to a materialization table",
                    cagg.view_name
                ),
            ));
        }
    }

    for dim in &catalog.dimensions {
        match dim.kind {
            DimensionKind::Time if !dim.chunk_interval_is_set() => failures.push(missing(
                TimeSeriesFeature::ChunkInterval,
                format!(
                    "hypertable '{}' time dimension '{}' has a zero or undefined chunk interval ({})",
                    dim.hypertable,
                    dim.column,
                    dim.time_interval.as_deref().unwrap_or("NULL")
                ),
            )),
            DimensionKind::Space if !dim.num_partitions.is_some_and(|n| n > 0) => {
                failures.push(missing(
                    TimeSeriesFeature::ChunkInterval,
                    format!(
                        "hypertable '{}' space dimension '{}' has no partitions",
                        dim.hypertable, dim.column
                    ),
                ))
            }
            _ => {}
        }
    }

    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    fn research_events_catalog() -> TimeSeriesCatalog {
        TimeSeriesCatalog {
            extension_version: Some("2.14.2".to_string()),
            hypertables: vec![HypertableInfo {
                name: "research_events".to_string(),
                compression_enabled: true,
            }],
            jobs: vec![
                PolicyJob {
                    job_id: 1000,
                    proc_name: COMPRESSION_PROC.to_string(),
                    hypertable: Some("research_events".to_string()),
                    compress_after: Some("30 days".to_string()),
                    drop_after: None,
                },
                PolicyJob {
                    job_id: 1001,
                    proc_name: RETENTION_PROC.to_string(),
                    hypertable: Some("research_events".to_string()),
                    compress_after: None,
                    drop_after: Some("1 year".to_string()),
                },
            ],
            continuous_aggregates: vec![ContinuousAggregateInfo {
                view_name: "research_events_daily".to_string(),
                materialization_table: Some("_materialized_hypertable_2".to_string()),
                materialization_exists: true,
            }],
            dimensions: vec![DimensionInfo {
                hypertable: "research_events".to_string(),
                column: "occurred_at".to_string(),
                kind: DimensionKind::Time,
                time_interval: Some("7 days".to_string()),
                interval_seconds: Some(604_800.0),
                integer_interval: None,
                num_partitions: None,
            }],
        }
    }

    fn full_expectations() -> TimeSeriesExpectations {
        TimeSeriesExpectations {
            hypertables: vec!["research_events".to_string()],
            compressed: vec!["research_events".to_string()],
            retained: vec!["research_events".to_string()],
            require_continuous_aggregate: true,
        }
    }

    fn features(failures: &[VerifyError]) -> Vec<TimeSeriesFeature> {
        failures
            .iter()
            .map(|f| match f {
                VerifyError::TimeSeriesFeatureMissing { feature, .. } => *feature,
                other => panic!("unexpected failure {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_fully_configured_catalog_passes() {
        assert!(validate(&research_events_catalog(), &full_expectations()).is_empty());
    }

    #[test]
    fn test_missing_extension() {
        let catalog = TimeSeriesCatalog::default();
        let failures = validate(&catalog, &full_expectations());
        assert_eq!(features(&failures), vec![TimeSeriesFeature::Extension; 4]);
        assert!(failures[1].to_string().contains("compression policies"));
        assert!(validate(&catalog, &TimeSeriesExpectations::default()).is_empty());
    }

    #[test]
    fn test_missing_hypertable_is_named() {
        let mut expectations = full_expectations();
        expectations.hypertables.push("price_ticks".to_string());

        let failures = validate(&research_events_catalog(), &expectations);
        assert_eq!(features(&failures), vec![TimeSeriesFeature::Hypertable]);
        assert!(failures[0].to_string().contains("'price_ticks'"));
    }

    #[test]
    fn test_policy_without_interval() {
        let mut catalog = research_events_catalog();
        catalog.jobs[0].compress_after = None;
        catalog.jobs.remove(1);

        let failures = validate(&catalog, &full_expectations());
        assert_eq!(
            features(&failures),
            vec![TimeSeriesFeature::CompressionPolicy, TimeSeriesFeature::RetentionPolicy]
        );
        assert!(failures[0].to_string().contains("job 1000"));
        assert!(failures[1].to_string().contains("no retention policy job for 'research_events'"));
    }

    #[test]
    fn test_compression_policy_requires_enabled_compression() {
        let mut catalog = research_events_catalog();
        catalog.hypertables[0].compression_enabled = false;
        let failures = validate(&catalog, &full_expectations());
        assert_eq!(features(&failures), vec![TimeSeriesFeature::CompressionPolicy]);
    }

    #[test]
    fn test_continuous_aggregate_checks() {
        let mut catalog = research_events_catalog();
        catalog.continuous_aggregates[0].materialization_exists = false;
        let failures = validate(&catalog, &full_expectations());
        assert_eq!(features(&failures), vec![TimeSeriesFeature::ContinuousAggregate]);
        assert!(failures[0].to_string().contains("research_events_daily"));

        catalog.continuous_aggregates.clear();
        let failures = validate(&catalog, &full_expectations());
        assert_eq!(features(&failures), vec![TimeSeriesFeature::ContinuousAggregate]);

        let mut relaxed = full_expectations();
        relaxed.require_continuous_aggregate = false;
        assert!(validate(&catalog, &relaxed).is_empty());
    }

    #[test]
    fn test_zero_chunk_interval() {
        let mut catalog = research_events_catalog();
        catalog.dimensions[0].time_interval = Some("00:00:00".to_string());
        catalog.dimensions[0].interval_seconds = Some(0.0);

        let failures = validate(&catalog, &full_expectations());
        assert_eq!(features(&failures), vec![TimeSeriesFeature::ChunkInterval]);
        assert!(failures[0].to_string().contains("occurred_at"));
    }

    #[test]
    fn test_integer_and_space_dimensions() {
        let mut catalog = research_events_catalog();
        catalog.dimensions = vec![
            DimensionInfo {
                hypertable: "ticks".to_string(),
                column: "ts".to_string(),
                kind: DimensionKind::Time,
                time_interval: None,
                interval_seconds: None,
                integer_interval: Some(86_400),
                num_partitions: None,
            },
            DimensionInfo {
                hypertable: "ticks".to_string(),
                column: "symbol".to_string(),
                kind: DimensionKind::Space,
                time_interval: None,
                interval_seconds: None,
                integer_interval: None,
                num_partitions: Some(4),
            },
        ];
        assert!(validate(&catalog, &full_expectations()).is_empty());

        catalog.dimensions[1].num_partitions = Some(0);
        assert_eq!(
            features(&validate(&catalog, &full_expectations())),
            vec![TimeSeriesFeature::ChunkInterval]
        );
    }

    #[test]
    fn test_expectations_is_empty() {
        assert!(TimeSeriesExpectations::default().is_empty());
        assert!(!full_expectations().is_empty());
    }
}
