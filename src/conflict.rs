//! Static conflict detection across forward scripts.
//!
//! Table names are pulled out of `CREATE TABLE`, `ALTER TABLE` and
//! `DROP TABLE` statements with regular expressions. This is best-effort:
//! DDL assembled dynamically (inside `DO` blocks via `EXECUTE`) is missed,
//! and schema qualifiers are dropped, so `a.t` and `b.t` count as one table.
//! Dollar-quoted bodies are scanned as plain text.
//! A real SQL parser could replace [`referenced_tables`] without changing
//! the report.

use crate::migration::{validate_ordering, DiscoveryError, MigrationPair};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const IDENT: &str = r#"(?:"(?:[^"]|"")+"|[A-Za-z_][A-Za-z0-9_$]*)"#;

static CREATE_OR_ALTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:CREATE\s+(?:(?:GLOBAL|LOCAL)\s+)?(?:(?:TEMP|TEMPORARY|UNLOGGED)\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?|ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?)(?P<name>{IDENT}(?:\s*\.\s*{IDENT})?)"
    ))
    .expect("CREATE/ALTER TABLE pattern is valid")
});

static DROP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bDROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?P<names>[^;]+)")
        .expect("DROP TABLE pattern is valid")
});

static QUALIFIED_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"^\s*(?P<name>{IDENT}(?:\s*\.\s*{IDENT})?)"))
        .expect("qualified name pattern is valid")
});

/// String literals, quoted identifiers and comments, leftmost first, so a
/// `--` inside a literal never starts a comment.
static LEXEMES: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)(?P<literal>'(?:[^']|'')*')|(?P<quoted>"(?:[^"]|"")*")|--[^\n]*|/\*.*?\*/"#)
        .expect("lexeme pattern is valid")
});

/// A table whose DDL appears in more than one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub table: String,
    /// Ascending, without repeats.
    pub migration_versions: Vec<i64>,
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let versions = self
            .migration_versions
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "table '{}' is modified by migrations {}", self.table, versions)
    }
}

/// Reduce a possibly qualified, possibly quoted name to its table part.
///
/// Unquoted identifiers fold to lower case the way PostgreSQL does.
fn normalize(qualified: &str) -> String {
    let last = split_qualified(qualified).pop().unwrap_or_default();
    match last.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => last.to_ascii_lowercase(),
    }
}

/// Split on dots that are outside double quotes.
fn split_qualified(qualified: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in qualified.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '.' if !in_quotes => parts.push(std::mem::take(&mut current).trim().to_string()),
            c if c.is_whitespace() && !in_quotes => {}
            c => current.push(c),
        }
    }
    parts.push(current.trim().to_string());
    parts
}

/// Drop comments and blank out string literal contents.
fn strip_comments(sql: &str) -> String {
    LEXEMES
        .replace_all(sql, |caps: &regex::Captures<'_>| {
            if caps.name("literal").is_some() {
                "''".to_string()
            } else if let Some(quoted) = caps.name("quoted") {
                quoted.as_str().to_string()
            } else {
                " ".to_string()
            }
        })
        .into_owned()
}

/// Tables named by `CREATE`/`ALTER`/`DROP TABLE` statements in `sql`.
pub fn referenced_tables(sql: &str) -> BTreeSet<String> {
    let sql = strip_comments(sql);
    let mut tables = BTreeSet::new();

    for caps in CREATE_OR_ALTER.captures_iter(&sql) {
        tables.insert(normalize(&caps["name"]));
    }

    for caps in DROP.captures_iter(&sql) {
        let names = caps["names"].trim_end();
        for candidate in names.split(',') {
            if let Some(name) = QUALIFIED_NAME.captures(candidate) {
                let table = normalize(&name["name"]);
                if !matches!(table.as_str(), "cascade" | "restrict") {
                    tables.insert(table);
                }
            }
        }
    }

    tables
}

/// Tables touched by the forward scripts of more than one migration.
///
/// Reports are advisory: later migrations altering earlier tables is normal,
/// but each overlap deserves review. Duplicate versions in `pairs` are a hard
/// error and are rejected before any scanning.
pub fn detect_conflicts(pairs: &[MigrationPair]) -> Result<Vec<ConflictReport>, DiscoveryError> {
    let mut sorted: Vec<&MigrationPair> = pairs.iter().collect();
    sorted.sort_by_key(|p| p.version);
    let ordered: Vec<MigrationPair> = sorted.into_iter().cloned().collect();
    validate_ordering(&ordered)?;

    let mut touched: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
    for pair in &ordered {
        for table in referenced_tables(&pair.up_script) {
            touched.entry(table).or_default().insert(pair.version);
        }
    }

    let reports: Vec<ConflictReport> = touched
        .into_iter()
        .filter(|(_, versions)| versions.len() > 1)
        .map(|(table, versions)| ConflictReport {
            table,
            migration_versions: versions.into_iter().collect(),
        })
        .collect();

    for report in &reports {
        log::warn!("{report}");
    }
    Ok(reports)
}
