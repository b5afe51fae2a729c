//! Discovery-phase errors. All of them abort a run before the database is touched.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// Migrations directory does not exist or is not a directory
    #[error("Migrations directory not found: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// Directory or file could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Filename prefix is not an integer
    #[error("Migration file '{file}' has malformed version prefix '{prefix}': expected an integer before the first '_'")]
    MalformedVersion { file: String, prefix: String },

    /// Two migrations share a version
    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: i64,
        first: String,
        second: String,
    },

    /// A forward script has no backward script, or the reverse
    #[error("Migration '{base}' has a {present} script but no {missing} script; every migration must be reversible")]
    UnpairedMigration {
        base: String,
        present: &'static str,
        missing: &'static str,
    },

    /// Versions are not strictly increasing
    #[error("Migration version {version} ('{name}') follows version {previous}; versions must be strictly increasing")]
    OutOfOrder {
        previous: i64,
        version: i64,
        name: String,
    },
}
