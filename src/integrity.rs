//! Data integrity checks run after the full migration chain.
//!
//! - orphan detection: one count per foreign-key relationship of child rows
//!   whose key has no matching parent row;
//! - primary-key coverage: every base table owns a primary key;
//! - preservation: row counts of pre-existing tables never go down across a
//!   migration unless the migration is annotated `destructive`.

use crate::error::VerifyError;
use crate::executor::{quote_ident, DbError, Executor};
use crate::migration::MigrationPair;
use crate::snapshot::{DataSnapshot, SchemaSnapshot};
use std::fmt;

/// A declared foreign key, columns in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRelationship {
    pub constraint: String,
    pub child_table: String,
    pub child_columns: Vec<String>,
    pub parent_schema: String,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
}

/// Orphan count for one relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyOrphans {
    pub constraint: String,
    pub child_table: String,
    pub child_columns: Vec<String>,
    pub parent_table: String,
    pub parent_columns: Vec<String>,
    pub orphan_count: i64,
}

impl fmt::Display for ForeignKeyOrphans {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} row(s) in {}({}) reference missing {}({})",
            self.constraint,
            self.orphan_count,
            self.child_table,
            self.child_columns.join(", "),
            self.parent_table,
            self.parent_columns.join(", ")
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanCheckResult {
    pub has_orphans: bool,
    /// Every relationship checked, orphaned or not.
    pub relationships: Vec<ForeignKeyOrphans>,
}

impl OrphanCheckResult {
    pub fn from_counts(relationships: Vec<ForeignKeyOrphans>) -> Self {
        Self {
            has_orphans: relationships.iter().any(|r| r.orphan_count > 0),
            relationships,
        }
    }

    /// Relationships with a nonzero orphan count.
    pub fn orphaned(&self) -> Vec<ForeignKeyOrphans> {
        self.relationships
            .iter()
            .filter(|r| r.orphan_count > 0)
            .cloned()
            .collect()
    }

    /// `OrphanedReference` when any relationship has orphans.
    pub fn into_failure(self) -> Option<VerifyError> {
        self.has_orphans.then(|| VerifyError::OrphanedReference {
            relationships: self.orphaned(),
        })
    }
}

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT con.conname::text,
           child.relname::text,
           ARRAY(
               SELECT a.attname::text
               FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
               JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
               ORDER BY k.ord
           ),
           parent_ns.nspname::text,
           parent.relname::text,
           ARRAY(
               SELECT a.attname::text
               FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
               JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
               ORDER BY k.ord
           )
    FROM pg_constraint con
    JOIN pg_class child ON child.oid = con.conrelid
    JOIN pg_namespace ns ON ns.oid = child.relnamespace
    JOIN pg_class parent ON parent.oid = con.confrelid
    JOIN pg_namespace parent_ns ON parent_ns.oid = parent.relnamespace
    WHERE con.contype = 'f'
      AND ns.nspname = $1
    ORDER BY con.conname
"#;

/// Every foreign key declared on tables of `schema`.
pub fn foreign_keys(
    executor: &dyn Executor,
    schema: &str,
) -> Result<Vec<ForeignKeyRelationship>, DbError> {
    let rows = executor.query_all(FOREIGN_KEYS_SQL, &[&schema])?;
    Ok(rows
        .iter()
        .map(|row| ForeignKeyRelationship {
            constraint: row.get(0),
            child_table: row.get(1),
            child_columns: row.get(2),
            parent_schema: row.get(3),
            parent_table: row.get(4),
            parent_columns: row.get(5),
        })
        .collect())
}

/// Count query for child rows of `fk` whose key matches no parent row.
///
/// Rows with a NULL in any key column are not orphans (`MATCH SIMPLE`).
pub fn orphan_count_sql(schema: &str, fk: &ForeignKeyRelationship) -> String {
    let not_null = fk
        .child_columns
        .iter()
        .map(|c| format!("c.{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let join_on = fk
        .child_columns
        .iter()
        .zip(&fk.parent_columns)
        .map(|(child, parent)| format!("p.{} = c.{}", quote_ident(parent), quote_ident(child)))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "SELECT COUNT(*) FROM {}.{} c WHERE {} AND NOT EXISTS (SELECT 1 FROM {}.{} p WHERE {})",
        quote_ident(schema),
        quote_ident(&fk.child_table),
        not_null,
        quote_ident(&fk.parent_schema),
        quote_ident(&fk.parent_table),
        join_on
    )
}

/// Run one orphan count per foreign key of `schema`.
pub fn check_orphans(executor: &dyn Executor, schema: &str) -> Result<OrphanCheckResult, DbError> {
    let mut counts = Vec::new();
    for fk in foreign_keys(executor, schema)? {
        let orphan_count: i64 = executor.query_one(&orphan_count_sql(schema, &fk), &[])?.get(0);
        if orphan_count > 0 {
            log::error!("{}: {} orphaned row(s) in {}", fk.constraint, orphan_count, fk.child_table);
        }
        counts.push(ForeignKeyOrphans {
            constraint: fk.constraint,
            child_table: fk.child_table,
            child_columns: fk.child_columns,
            parent_table: fk.parent_table,
            parent_columns: fk.parent_columns,
            orphan_count,
        });
    }
    Ok(OrphanCheckResult::from_counts(counts))
}

/// One `MissingPrimaryKey` per base table without a primary-key constraint.
pub fn check_primary_keys(snapshot: &SchemaSnapshot) -> Vec<VerifyError> {
    let pk_tables = snapshot.primary_key_tables();
    snapshot
        .base_tables
        .iter()
        .filter(|table| !pk_tables.contains(table.as_str()))
        .map(|table| VerifyError::MissingPrimaryKey {
            table: table.clone(),
        })
        .collect()
}

/// Compare row counts taken around `migration`'s forward script.
///
/// Decreases fail the check unless the migration is annotated destructive,
/// in which case they are only logged.
pub fn check_preservation(
    migration: &MigrationPair,
    before: &DataSnapshot,
    after: &DataSnapshot,
) -> Vec<VerifyError> {
    let decreases = before.decreases(after);
    if migration.annotations.destructive {
        for d in &decreases {
            log::warn!(
                "{migration} removed rows from {} ({} -> {}); allowed by destructive annotation",
                d.table,
                d.before,
                d.after
            );
        }
        return Vec::new();
    }

    decreases
        .into_iter()
        .map(|d| VerifyError::DataLoss {
            migration: migration.to_string(),
            table: d.table,
            before: d.before,
            after: d.after,
        })
        .collect()
}
