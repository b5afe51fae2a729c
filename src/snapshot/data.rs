//! Row-count fingerprint used for before/after comparisons.

use crate::executor::{quote_ident, DbError, Executor};
use std::collections::BTreeMap;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

const BASE_TABLES_SQL: &str = r#"
    SELECT c.relname::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
    ORDER BY c.relname
"#;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataSnapshot {
    pub row_counts: BTreeMap<String, i64>,
}

/// A table whose row count went down between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCountDecrease {
    pub table: String,
    pub before: i64,
    /// `0` when the table no longer exists.
    pub after: i64,
}

impl DataSnapshot {
    pub fn count(&self, table: &str) -> Option<i64> {
        self.row_counts.get(table).copied()
    }

    /// Tables present in `self` whose count is lower in `after`.
    ///
    /// Tables created after `self` was taken are ignored; dropped tables
    /// count as zero rows.
    pub fn decreases(&self, after: &DataSnapshot) -> Vec<RowCountDecrease> {
        self.row_counts
            .iter()
            .filter_map(|(table, &before)| {
                let now = after.count(table).unwrap_or(0);
                (now < before).then(|| RowCountDecrease {
                    table: table.clone(),
                    before,
                    after: now,
                })
            })
            .collect()
    }
}

/// `COUNT(*)` of every base table in `schema`.
pub fn capture_data(executor: &dyn Executor, schema: &str) -> Result<DataSnapshot, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::capture_span("data").entered();

    let tables: Vec<String> = executor
        .query_all(BASE_TABLES_SQL, &[&schema])?
        .iter()
        .map(|row| row.get(0))
        .collect();

    let mut row_counts = BTreeMap::new();
    for table in tables {
        let sql = format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(schema),
            quote_ident(&table)
        );
        let count: i64 = executor.query_one(&sql, &[])?.get(0);
        row_counts.insert(table, count);
    }

    Ok(DataSnapshot { row_counts })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(counts: &[(&str, i64)]) -> DataSnapshot {
        DataSnapshot {
            row_counts: counts.iter().map(|(t, c)| (t.to_string(), *c)).collect(),
        }
    }

    #[test]
    fn test_growth_and_new_tables_are_not_decreases() {
        let before = snapshot(&[("companies", 3), ("metrics", 10)]);
        let after = snapshot(&[("companies", 3), ("metrics", 12), ("sectors", 0)]);
        assert!(before.decreases(&after).is_empty());
    }

    #[test]
    fn test_decrease_and_dropped_table() {
        let before = snapshot(&[("companies", 3), ("legacy_metrics", 5), ("metrics", 10)]);
        let after = snapshot(&[("companies", 1), ("metrics", 10)]);

        let decreases = before.decreases(&after);
        assert_eq!(
            decreases,
            vec![
                RowCountDecrease {
                    table: "companies".to_string(),
                    before: 3,
                    after: 1
                },
                RowCountDecrease {
                    table: "legacy_metrics".to_string(),
                    before: 5,
                    after: 0
                },
            ]
        );
    }

    #[test]
    fn test_empty_table_dropped_is_not_a_decrease() {
        let before = snapshot(&[("scratch", 0)]);
        let after = snapshot(&[]);
        assert!(before.decreases(&after).is_empty());
    }
}
