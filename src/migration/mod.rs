//! Migration discovery, ordering and ledger bookkeeping.
//!
//! # Example
//!
//! ```rust,no_run
//! use tidewatch::migration::discover_migrations;
//! use std::path::Path;
//!
//! let pairs = discover_migrations(Path::new("migrations"))?;
//! for pair in &pairs {
//!     println!("{} -> {} bytes forward", pair, pair.up_script.len());
//! }
//! # Ok::<(), tidewatch::migration::DiscoveryError>(())
//! ```

pub mod checksum;
pub mod error;
pub mod file;
pub mod ledger;

pub use checksum::pair_checksum;
pub use error::DiscoveryError;
pub use file::{
    discover_migrations, parse_base_name, validate_ordering, MigrationAnnotations, MigrationPair,
};
pub use ledger::{initialize_ledger, LedgerRecord};
