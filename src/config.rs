//! Verifier configuration.
//!
//! Settings are read from `config/tidewatch.toml` (optional) and overridden by
//! `TIDEWATCH__<SECTION>__<KEY>` environment variables, e.g.
//! `TIDEWATCH__DATABASE__HOST=db.internal`.
//!
//! ```toml
//! [database]
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! password = "postgres"
//! admin_database = "postgres"
//! test_database = "tidewatch_test"
//!
//! [migrations]
//! directory = "migrations"
//! schema = "public"
//!
//! [timeseries]
//! hypertables = ["research_events"]
//! compressed = ["research_events"]
//! retained = ["research_events"]
//! require_continuous_aggregate = true
//!
//! [run]
//! budget_seconds = 30
//! ```

use crate::timeseries::TimeSeriesExpectations;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/tidewatch.toml";
const ENV_PREFIX: &str = "TIDEWATCH";

/// Top-level configuration for one verification run.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct VerifierConfig {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub migrations: MigrationSettings,
    #[serde(default)]
    pub timeseries: TimeSeriesExpectations,
    #[serde(default)]
    pub run: RunSettings,
}

/// Administrative credentials. The user must be able to create and drop
/// databases and to create the `timescaledb` extension.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Database used for `DROP DATABASE` / `CREATE DATABASE`.
    #[serde(default = "default_admin_database")]
    pub admin_database: String,
    /// Throwaway database recreated at the start of every run.
    #[serde(default = "default_test_database")]
    pub test_database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationSettings {
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,
    /// Application schema inspected by snapshots and integrity checks.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Ledger table recording applied migrations.
    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    /// Wall-clock budget for the whole run.
    #[serde(default = "default_budget_seconds")]
    pub budget_seconds: u64,
    /// Session `statement_timeout`; `0` disables it.
    #[serde(default = "default_statement_timeout_seconds")]
    pub statement_timeout_seconds: u64,
    /// Keep the test database after the run (for post-mortem inspection).
    #[serde(default)]
    pub keep_database: bool,
    /// Run the malformed-script rollback probe after the full chain.
    #[serde(default = "default_true")]
    pub failure_probe: bool,
    /// Create the `timescaledb` extension during setup.
    #[serde(default = "default_true")]
    pub enable_extension: bool,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_password() -> String {
    "postgres".to_string()
}

fn default_admin_database() -> String {
    "postgres".to_string()
}

fn default_test_database() -> String {
    "tidewatch_test".to_string()
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_ledger_table() -> String {
    "tidewatch_migrations".to_string()
}

fn default_budget_seconds() -> u64 {
    30
}

fn default_statement_timeout_seconds() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_password(),
            admin_database: default_admin_database(),
            test_database: default_test_database(),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            schema: default_schema(),
            ledger_table: default_ledger_table(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            budget_seconds: default_budget_seconds(),
            statement_timeout_seconds: default_statement_timeout_seconds(),
            keep_database: false,
            failure_probe: true,
            enable_extension: true,
        }
    }
}

impl RunSettings {
    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_seconds)
    }
}

impl VerifierConfig {
    /// Load from `config/tidewatch.toml` (if present) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from `path` (optional) and the environment.
    ///
    /// An unreadable or malformed file is logged and skipped, leaving the
    /// environment as the only source.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(environment());

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if path.exists() {
                    log::warn!(
                        "failed to load {}, falling back to environment: {}",
                        path.display(),
                        err
                    );
                }
                Config::builder()
                    .add_source(environment())
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {}, then env-only error: {}",
                            err, env_err
                        ))
                    })?
            }
        };

        settings.try_deserialize::<VerifierConfig>()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("timeseries.hypertables")
        .with_list_parse_key("timeseries.compressed")
        .with_list_parse_key("timeseries.retained")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = VerifierConfig::default();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.admin_database, "postgres");
        assert_eq!(config.migrations.schema, "public");
        assert_eq!(config.migrations.ledger_table, "tidewatch_migrations");
        assert_eq!(config.run.budget(), Duration::from_secs(30));
        assert!(config.run.failure_probe);
        assert!(!config.run.keep_database);
        assert!(config.timeseries.hypertables.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[database]
host = "timescale.test"
port = 6543
test_database = "verify_scratch"

[migrations]
directory = "db/migrations"

[timeseries]
hypertables = ["research_events", "price_ticks"]
compressed = ["research_events"]
require_continuous_aggregate = true

[run]
budget_seconds = 45
keep_database = true
"#
        )
        .unwrap();

        let config = VerifierConfig::load_from(file.path()).unwrap();
        assert_eq!(config.database.host, "timescale.test");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.user, "postgres");
        assert_eq!(config.database.test_database, "verify_scratch");
        assert_eq!(config.migrations.directory, PathBuf::from("db/migrations"));
        assert_eq!(config.migrations.schema, "public");
        assert_eq!(
            config.timeseries.hypertables,
            vec!["research_events".to_string(), "price_ticks".to_string()]
        );
        assert_eq!(config.timeseries.compressed, vec!["research_events".to_string()]);
        assert!(config.timeseries.retained.is_empty());
        assert!(config.timeseries.require_continuous_aggregate);
        assert_eq!(config.run.budget_seconds, 45);
        assert!(config.run.keep_database);
        assert!(config.run.failure_probe);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = VerifierConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.database.host, "localhost");
        assert_eq!(config.run.budget_seconds, 30);
    }
}
