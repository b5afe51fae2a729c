//! Migration file discovery, pairing and ordering.
//!
//! A migrations directory holds `<version>_<name>.up.<ext>` and
//! `<version>_<name>.down.<ext>` files, plus an optional
//! `<version>_<name>.seed.<ext>` with representative rows for the tables the
//! migration creates. Files sharing a base name form one [`MigrationPair`].

use crate::migration::checksum::pair_checksum;
use crate::migration::DiscoveryError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

static MIGRATION_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<base>.+)\.(?P<kind>up|down|seed)\.(?P<ext>[A-Za-z0-9]+)$")
        .expect("migration file pattern is valid")
});

/// Header directive prefix, e.g. `-- tidewatch: destructive`.
const DIRECTIVE_PREFIX: &str = "tidewatch:";

/// Per-migration directives read from the forward script's header comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationAnnotations {
    /// The migration intentionally deletes rows; row-count decreases are expected.
    pub destructive: bool,
    /// Apply the scripts without an explicit transaction.
    pub transactional: bool,
}

impl Default for MigrationAnnotations {
    fn default() -> Self {
        Self {
            destructive: false,
            transactional: true,
        }
    }
}

impl MigrationAnnotations {
    /// Parse directives from the leading comment block of `script`.
    ///
    /// ```
    /// use tidewatch::migration::MigrationAnnotations;
    ///
    /// let script = "-- Purge stale sessions\n-- tidewatch: destructive\nDELETE FROM sessions;";
    /// let annotations = MigrationAnnotations::parse(script);
    /// assert!(annotations.destructive);
    /// assert!(annotations.transactional);
    /// ```
    pub fn parse(script: &str) -> Self {
        let mut annotations = Self::default();

        for line in script.lines().map(str::trim) {
            if line.is_empty() {
                continue;
            }
            let Some(comment) = line.strip_prefix("--") else {
                break;
            };
            let Some(directives) = comment.trim().strip_prefix(DIRECTIVE_PREFIX) else {
                continue;
            };
            for directive in directives
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|d| !d.is_empty())
            {
                match directive.to_ascii_lowercase().as_str() {
                    "destructive" => annotations.destructive = true,
                    "no-transaction" => annotations.transactional = false,
                    other => log::warn!("ignoring unknown migration directive '{other}'"),
                }
            }
        }

        annotations
    }
}

/// One reversible migration: a forward script and its exact structural inverse.
#[derive(Debug, Clone)]
pub struct MigrationPair {
    pub version: i64,
    pub name: String,
    /// Base file name shared by both scripts, e.g. `001_create_companies`.
    pub base_name: String,
    pub up_script: String,
    pub down_script: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
    pub seed_script: Option<String>,
    pub annotations: MigrationAnnotations,
    /// SHA-256 of both scripts, recorded in the ledger.
    pub checksum: String,
}

impl MigrationPair {
    /// Build a pair from in-memory scripts.
    pub fn new(
        version: i64,
        name: impl Into<String>,
        up_script: impl Into<String>,
        down_script: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let up_script = up_script.into();
        let down_script = down_script.into();
        Self {
            version,
            base_name: format!("{version:03}_{name}"),
            annotations: MigrationAnnotations::parse(&up_script),
            checksum: pair_checksum(&up_script, &down_script),
            name,
            up_script,
            down_script,
            up_path: PathBuf::new(),
            down_path: PathBuf::new(),
            seed_script: None,
        }
    }
}

impl fmt::Display for MigrationPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (version {})", self.base_name, self.version)
    }
}

/// Split a base name into its version and name.
///
/// The version is everything before the first `_` and must consist of ASCII
/// digits only; zero padding is allowed.
///
/// ```
/// use tidewatch::migration::parse_base_name;
///
/// assert_eq!(parse_base_name("001_create_companies").unwrap(), (1, "create_companies".to_string()));
/// assert!(parse_base_name("v1_create_companies").is_err());
/// ```
pub fn parse_base_name(base: &str) -> Result<(i64, String), DiscoveryError> {
    let (prefix, name) = base.split_once('_').unwrap_or((base, ""));

    let malformed = || DiscoveryError::MalformedVersion {
        file: base.to_string(),
        prefix: prefix.to_string(),
    };

    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let version = prefix.parse::<i64>().map_err(|_| malformed())?;

    Ok((version, name.to_string()))
}

#[derive(Default)]
struct PairFiles {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
    seed: Option<PathBuf>,
}

/// Discover, pair and order all migrations in `migrations_dir`.
///
/// Files not following the naming convention are ignored. The result is
/// sorted by version and guaranteed strictly increasing.
pub fn discover_migrations(migrations_dir: &Path) -> Result<Vec<MigrationPair>, DiscoveryError> {
    if !migrations_dir.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(migrations_dir.to_path_buf()));
    }

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| DiscoveryError::Io { path, source }
    };

    let mut file_names = Vec::new();
    for entry in fs::read_dir(migrations_dir).map_err(io_err(migrations_dir))? {
        let entry = entry.map_err(io_err(migrations_dir))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            file_names.push(name.to_string());
        }
    }
    file_names.sort();

    let mut grouped: BTreeMap<String, PairFiles> = BTreeMap::new();
    for file_name in &file_names {
        let Some(caps) = MIGRATION_FILE.captures(file_name) else {
            log::debug!("skipping non-migration file {file_name}");
            continue;
        };
        let base = caps["base"].to_string();
        let path = migrations_dir.join(file_name);
        let files = grouped.entry(base.clone()).or_default();
        let slot = match &caps["kind"] {
            "up" => &mut files.up,
            "down" => &mut files.down,
            _ => &mut files.seed,
        };
        if let Some(existing) = slot {
            let (version, _) = parse_base_name(&base)?;
            return Err(DiscoveryError::DuplicateVersion {
                version,
                first: display_name(existing),
                second: file_name.clone(),
            });
        }
        *slot = Some(path);
    }

    let mut pairs = Vec::with_capacity(grouped.len());
    for (base, files) in grouped {
        let (version, name) = parse_base_name(&base)?;
        let has_down = files.down.is_some();

        let (up_path, down_path) = match (files.up, files.down) {
            (Some(up), Some(down)) => (up, down),
            (Some(_), None) => {
                return Err(DiscoveryError::UnpairedMigration {
                    base,
                    present: "forward",
                    missing: "backward",
                })
            }
            (None, _) => {
                return Err(DiscoveryError::UnpairedMigration {
                    base,
                    present: if has_down { "backward" } else { "seed" },
                    missing: "forward",
                })
            }
        };

        let up_script = fs::read_to_string(&up_path).map_err(io_err(&up_path))?;
        let down_script = fs::read_to_string(&down_path).map_err(io_err(&down_path))?;
        let seed_script = match &files.seed {
            Some(seed_path) => Some(fs::read_to_string(seed_path).map_err(io_err(seed_path))?),
            None => None,
        };

        pairs.push(MigrationPair {
            version,
            name,
            base_name: base,
            annotations: MigrationAnnotations::parse(&up_script),
            checksum: pair_checksum(&up_script, &down_script),
            up_script,
            down_script,
            up_path,
            down_path,
            seed_script,
        });
    }

    pairs.sort_by_key(|p| p.version);
    validate_ordering(&pairs)?;

    log::info!(
        "discovered {} migration(s) in {}",
        pairs.len(),
        migrations_dir.display()
    );
    Ok(pairs)
}

/// Check that versions are strictly increasing.
///
/// Equal neighbours are reported as [`DiscoveryError::DuplicateVersion`],
/// decreasing ones as [`DiscoveryError::OutOfOrder`].
pub fn validate_ordering(pairs: &[MigrationPair]) -> Result<(), DiscoveryError> {
    for window in pairs.windows(2) {
        let (prev, next) = (&window[0], &window[1]);
        if next.version == prev.version {
            return Err(DiscoveryError::DuplicateVersion {
                version: next.version,
                first: prev.base_name.clone(),
                second: next.base_name.clone(),
            });
        }
        if next.version < prev.version {
            return Err(DiscoveryError::OutOfOrder {
                previous: prev.version,
                version: next.version,
                name: next.name.clone(),
            });
        }
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_parse_base_name() {
        assert_eq!(parse_base_name("001_create_companies").unwrap(), (1, "create_companies".to_string()));
        assert_eq!(parse_base_name("20240120120000_add_index").unwrap(), (20_240_120_120_000, "add_index".to_string()));
        assert_eq!(parse_base_name("7").unwrap(), (7, String::new()));
    }

    #[test]
    fn test_parse_base_name_malformed() {
        for base in ["v1_init", "1a_init", "_init", "-1_init", "99999999999999999999_big"] {
            match parse_base_name(base) {
                Err(DiscoveryError::MalformedVersion { file, .. }) => assert_eq!(file, base),
                other => panic!("expected MalformedVersion for {base}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_discover_orders_by_numeric_version() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "10_late.up.sql", "CREATE TABLE late (id INT PRIMARY KEY);");
        write(dir.path(), "10_late.down.sql", "DROP TABLE late;");
        write(dir.path(), "002_create_metrics.up.sql", "CREATE TABLE metrics (id INT PRIMARY KEY);");
        write(dir.path(), "002_create_metrics.down.sql", "DROP TABLE metrics;");
        write(dir.path(), "001_create_companies.up.sql", "CREATE TABLE companies (id INT PRIMARY KEY);");
        write(dir.path(), "001_create_companies.down.sql", "DROP TABLE companies;");
        write(dir.path(), "README.md", "not a migration");

        let pairs = discover_migrations(dir.path()).unwrap();
        let versions: Vec<i64> = pairs.iter().map(|p| p.version).collect();
        assert_eq!(versions, vec![1, 2, 10]);
        assert_eq!(pairs[0].name, "create_companies");
        assert_eq!(pairs[0].base_name, "001_create_companies");
        assert_eq!(pairs[0].down_script, "DROP TABLE companies;");
        assert!(pairs[0].up_path.ends_with("001_create_companies.up.sql"));
        assert!(pairs[0].seed_script.is_none());
        assert_eq!(pairs[0].checksum.len(), 64);
    }

    #[test]
    fn test_discover_reads_seed_and_annotations() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "004_purge_stale.up.sql",
            "-- tidewatch: destructive, no-transaction\nDELETE FROM companies WHERE stale;",
        );
        write(dir.path(), "004_purge_stale.down.sql", "SELECT 1;");
        write(dir.path(), "004_purge_stale.seed.sql", "INSERT INTO companies VALUES (1);");

        let pairs = discover_migrations(dir.path()).unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].annotations.destructive);
        assert!(!pairs[0].annotations.transactional);
        assert_eq!(pairs[0].seed_script.as_deref(), Some("INSERT INTO companies VALUES (1);"));
    }

    #[test]
    fn test_forward_without_backward_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_create_companies.up.sql", "CREATE TABLE companies (id INT);");

        match discover_migrations(dir.path()) {
            Err(DiscoveryError::UnpairedMigration { base, present, missing }) => {
                assert_eq!(base, "001_create_companies");
                assert_eq!(present, "forward");
                assert_eq!(missing, "backward");
            }
            other => panic!("expected UnpairedMigration, got {other:?}"),
        }
    }

    #[test]
    fn test_backward_without_forward_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "001_create_companies.down.sql", "DROP TABLE companies;");

        assert!(matches!(
            discover_migrations(dir.path()),
            Err(DiscoveryError::UnpairedMigration { missing: "forward", .. })
        ));
    }

    #[test]
    fn test_duplicate_versions_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        for base in ["001_create_companies", "1_create_metrics"] {
            write(dir.path(), &format!("{base}.up.sql"), "SELECT 1;");
            write(dir.path(), &format!("{base}.down.sql"), "SELECT 1;");
        }

        match discover_migrations(dir.path()) {
            Err(DiscoveryError::DuplicateVersion { version, .. }) => assert_eq!(version, 1),
            other => panic!("expected DuplicateVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "init_schema.up.sql", "SELECT 1;");
        write(dir.path(), "init_schema.down.sql", "SELECT 1;");

        assert!(matches!(
            discover_migrations(dir.path()),
            Err(DiscoveryError::MalformedVersion { .. })
        ));
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            discover_migrations(&missing),
            Err(DiscoveryError::DirectoryNotFound(p)) if p == missing
        ));
    }

    #[test]
    fn test_validate_ordering() {
        let a = MigrationPair::new(1, "a", "SELECT 1;", "SELECT 1;");
        let b = MigrationPair::new(2, "b", "SELECT 1;", "SELECT 1;");
        let b_again = MigrationPair::new(2, "b_again", "SELECT 1;", "SELECT 1;");

        assert!(validate_ordering(&[a.clone(), b.clone()]).is_ok());
        assert!(validate_ordering(&[]).is_ok());
        assert!(matches!(
            validate_ordering(&[a.clone(), b.clone(), b_again]),
            Err(DiscoveryError::DuplicateVersion { version: 2, .. })
        ));
        assert!(matches!(
            validate_ordering(&[b, a]),
            Err(DiscoveryError::OutOfOrder { previous: 2, version: 1, .. })
        ));
    }

    #[test]
    fn test_annotations_only_read_from_header() {
        let script = "CREATE TABLE t (id INT);\n-- tidewatch: destructive\n";
        assert_eq!(MigrationAnnotations::parse(script), MigrationAnnotations::default());

        let script = "\n-- Adds t\n--tidewatch:no-transaction\nCREATE TABLE t (id INT);";
        let annotations = MigrationAnnotations::parse(script);
        assert!(!annotations.transactional);
        assert!(!annotations.destructive);
    }
}
