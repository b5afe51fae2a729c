//! Structural fingerprint of one database schema.
//!
//! Snapshots are sets, so two captures compare equal regardless of the order
//! the catalog returned rows in.

use crate::executor::{DbError, Executor};
use std::collections::BTreeSet;
use std::fmt;

#[cfg(feature = "tracing")]
use crate::tracing_helpers;

/// One column of a table, view or materialized view.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableColumn {
    pub table: String,
    pub column: String,
    /// Type as rendered by `format_type`, modifiers included (`character varying(255)`).
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexDef {
    pub table: String,
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
    Exclusion,
    Other(String),
}

impl ConstraintKind {
    /// Map a `pg_constraint.contype` code.
    pub fn from_contype(code: &str) -> Self {
        match code {
            "p" => ConstraintKind::PrimaryKey,
            "f" => ConstraintKind::ForeignKey,
            "u" => ConstraintKind::Unique,
            "c" => ConstraintKind::Check,
            "x" => ConstraintKind::Exclusion,
            other => ConstraintKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::PrimaryKey => f.write_str("PRIMARY KEY"),
            ConstraintKind::ForeignKey => f.write_str("FOREIGN KEY"),
            ConstraintKind::Unique => f.write_str("UNIQUE"),
            ConstraintKind::Check => f.write_str("CHECK"),
            ConstraintKind::Exclusion => f.write_str("EXCLUDE"),
            ConstraintKind::Other(code) => write!(f, "contype '{code}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintDef {
    pub name: String,
    pub table: String,
    pub kind: ConstraintKind,
    /// `pg_get_constraintdef` output, so a changed CHECK clause is drift too.
    pub definition: String,
}

/// Tables, columns, indexes and constraints of a schema at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    /// (table, column, type, nullability) for every relation in the schema.
    pub tables: BTreeSet<TableColumn>,
    pub indexes: BTreeSet<IndexDef>,
    pub constraints: BTreeSet<ConstraintDef>,
    /// Names of ordinary and partitioned tables (views excluded).
    pub base_tables: BTreeSet<String>,
}

impl SchemaSnapshot {
    pub fn has_table(&self, table: &str) -> bool {
        self.base_tables.contains(table)
    }

    /// Tables owning at least one primary-key constraint.
    pub fn primary_key_tables(&self) -> BTreeSet<&str> {
        self.constraints
            .iter()
            .filter(|c| c.kind == ConstraintKind::PrimaryKey)
            .map(|c| c.table.as_str())
            .collect()
    }

    /// Entries present only in `self` (removed) or only in `other` (added),
    /// reading `self` as the earlier snapshot.
    pub fn diff(&self, other: &SchemaSnapshot) -> SchemaDiff {
        SchemaDiff {
            added_tables: other.base_tables.difference(&self.base_tables).cloned().collect(),
            removed_tables: self.base_tables.difference(&other.base_tables).cloned().collect(),
            added_columns: other.tables.difference(&self.tables).cloned().collect(),
            removed_columns: self.tables.difference(&other.tables).cloned().collect(),
            added_indexes: other.indexes.difference(&self.indexes).cloned().collect(),
            removed_indexes: self.indexes.difference(&other.indexes).cloned().collect(),
            added_constraints: other.constraints.difference(&self.constraints).cloned().collect(),
            removed_constraints: self.constraints.difference(&other.constraints).cloned().collect(),
        }
    }
}

/// Structural difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added_tables: Vec<String>,
    pub removed_tables: Vec<String>,
    pub added_columns: Vec<TableColumn>,
    pub removed_columns: Vec<TableColumn>,
    pub added_indexes: Vec<IndexDef>,
    pub removed_indexes: Vec<IndexDef>,
    pub added_constraints: Vec<ConstraintDef>,
    pub removed_constraints: Vec<ConstraintDef>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added_tables.is_empty()
            && self.removed_tables.is_empty()
            && self.added_columns.is_empty()
            && self.removed_columns.is_empty()
            && self.added_indexes.is_empty()
            && self.removed_indexes.is_empty()
            && self.added_constraints.is_empty()
            && self.removed_constraints.is_empty()
    }
}

impl fmt::Display for SchemaDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("  (no structural differences)");
        }

        let mut lines = Vec::new();
        for table in &self.added_tables {
            lines.push(format!("  + table {table}"));
        }
        for table in &self.removed_tables {
            lines.push(format!("  - table {table}"));
        }
        for (sign, columns) in [("+", &self.added_columns), ("-", &self.removed_columns)] {
            for c in columns {
                let null = if c.nullable { "NULL" } else { "NOT NULL" };
                lines.push(format!("  {sign} column {}.{} {} {null}", c.table, c.column, c.data_type));
            }
        }
        for (sign, indexes) in [("+", &self.added_indexes), ("-", &self.removed_indexes)] {
            for i in indexes {
                lines.push(format!("  {sign} index {} on {}: {}", i.name, i.table, i.definition));
            }
        }
        for (sign, constraints) in [("+", &self.added_constraints), ("-", &self.removed_constraints)] {
            for c in constraints {
                lines.push(format!(
                    "  {sign} constraint {} on {} ({}): {}",
                    c.name, c.table, c.kind, c.definition
                ));
            }
        }
        f.write_str(&lines.join("\n"))
    }
}

const COLUMNS_SQL: &str = r#"
    SELECT c.relname::text, a.attname::text, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
    FROM pg_attribute a
    JOIN pg_class c ON c.oid = a.attrelid
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p', 'v', 'm', 'f')
      AND a.attnum > 0
      AND NOT a.attisdropped
"#;

const BASE_TABLES_SQL: &str = r#"
    SELECT c.relname::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE n.nspname = $1
      AND c.relkind IN ('r', 'p')
"#;

const INDEXES_SQL: &str = r#"
    SELECT tablename::text, indexname::text, indexdef
    FROM pg_indexes
    WHERE schemaname = $1
"#;

const CONSTRAINTS_SQL: &str = r#"
    SELECT con.conname::text, cls.relname::text, con.contype::text, pg_get_constraintdef(con.oid)
    FROM pg_constraint con
    JOIN pg_class cls ON cls.oid = con.conrelid
    JOIN pg_namespace ns ON ns.oid = cls.relnamespace
    WHERE ns.nspname = $1
"#;

/// Capture the structure of `schema`. Read-only.
pub fn capture_schema(executor: &dyn Executor, schema: &str) -> Result<SchemaSnapshot, DbError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::capture_span("schema").entered();

    let tables = executor
        .query_all(COLUMNS_SQL, &[&schema])?
        .iter()
        .map(|row| TableColumn {
            table: row.get(0),
            column: row.get(1),
            data_type: row.get(2),
            nullable: row.get(3),
        })
        .collect();

    let base_tables = executor
        .query_all(BASE_TABLES_SQL, &[&schema])?
        .iter()
        .map(|row| row.get::<_, String>(0))
        .collect();

    let indexes = executor
        .query_all(INDEXES_SQL, &[&schema])?
        .iter()
        .map(|row| IndexDef {
            table: row.get(0),
            name: row.get(1),
            definition: row.get(2),
        })
        .collect();

    let constraints = executor
        .query_all(CONSTRAINTS_SQL, &[&schema])?
        .iter()
        .map(|row| ConstraintDef {
            name: row.get(0),
            table: row.get(1),
            kind: ConstraintKind::from_contype(row.get::<_, &str>(2)),
            definition: row.get(3),
        })
        .collect();

    Ok(SchemaSnapshot {
        tables,
        indexes,
        constraints,
        base_tables,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn column(table: &str, column: &str, data_type: &str, nullable: bool) -> TableColumn {
        TableColumn {
            table: table.to_string(),
            column: column.to_string(),
            data_type: data_type.to_string(),
            nullable,
        }
    }

    pub(crate) fn primary_key(table: &str) -> ConstraintDef {
        ConstraintDef {
            name: format!("{table}_pkey"),
            table: table.to_string(),
            kind: ConstraintKind::PrimaryKey,
            definition: "PRIMARY KEY (id)".to_string(),
        }
    }

    pub(crate) fn companies_snapshot() -> SchemaSnapshot {
        let mut snapshot = SchemaSnapshot::default();
        snapshot.base_tables.insert("companies".to_string());
        snapshot.tables.insert(column("companies", "id", "integer", false));
        snapshot.tables.insert(column("companies", "name", "text", false));
        snapshot.constraints.insert(primary_key("companies"));
        snapshot.indexes.insert(IndexDef {
            table: "companies".to_string(),
            name: "companies_pkey".to_string(),
            definition: "CREATE UNIQUE INDEX companies_pkey ON public.companies USING btree (id)".to_string(),
        });
        snapshot
    }

    #[test]
    fn test_equality_ignores_insertion_order() {
        let a = companies_snapshot();

        let mut b = SchemaSnapshot::default();
        b.tables.insert(column("companies", "name", "text", false));
        b.indexes.extend(a.indexes.iter().cloned());
        b.constraints.insert(primary_key("companies"));
        b.tables.insert(column("companies", "id", "integer", false));
        b.base_tables.insert("companies".to_string());

        assert_eq!(a, b);
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn test_equality_does_not_ignore_content() {
        let a = companies_snapshot();
        let mut b = a.clone();
        b.tables.remove(&column("companies", "name", "text", false));
        b.tables.insert(column("companies", "name", "text", true));

        assert_ne!(a, b);
        let diff = a.diff(&b);
        assert_eq!(diff.added_columns, vec![column("companies", "name", "text", true)]);
        assert_eq!(diff.removed_columns, vec![column("companies", "name", "text", false)]);
        assert!(diff.added_tables.is_empty());
    }

    #[test]
    fn test_diff_reports_added_table() {
        let before = companies_snapshot();
        let mut after = before.clone();
        after.base_tables.insert("metrics".to_string());
        after.tables.insert(column("metrics", "id", "bigint", false));
        after.constraints.insert(primary_key("metrics"));

        let diff = before.diff(&after);
        assert_eq!(diff.added_tables, vec!["metrics".to_string()]);
        assert!(diff.removed_tables.is_empty());

        let rendered = diff.to_string();
        assert!(rendered.contains("+ table metrics"));
        assert!(rendered.contains("+ column metrics.id bigint NOT NULL"));
        assert!(rendered.contains("+ constraint metrics_pkey on metrics (PRIMARY KEY)"));
    }

    #[test]
    fn test_primary_key_tables() {
        let mut snapshot = companies_snapshot();
        snapshot.base_tables.insert("audit_log".to_string());
        let pk_tables = snapshot.primary_key_tables();
        assert!(pk_tables.contains("companies"));
        assert!(!pk_tables.contains("audit_log"));
    }

    #[test]
    fn test_constraint_kind_from_contype() {
        assert_eq!(ConstraintKind::from_contype("p"), ConstraintKind::PrimaryKey);
        assert_eq!(ConstraintKind::from_contype("f"), ConstraintKind::ForeignKey);
        assert_eq!(ConstraintKind::from_contype("u"), ConstraintKind::Unique);
        assert_eq!(ConstraintKind::from_contype("c"), ConstraintKind::Check);
        assert_eq!(ConstraintKind::from_contype("x"), ConstraintKind::Exclusion);
        assert_eq!(ConstraintKind::from_contype("t"), ConstraintKind::Other("t".to_string()));
    }

    #[test]
    fn test_empty_diff_display() {
        assert_eq!(SchemaDiff::default().to_string(), "  (no structural differences)");
    }
}
