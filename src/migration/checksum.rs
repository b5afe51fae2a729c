//! Checksums recorded in the ledger for each applied migration.

use sha2::{Digest, Sha256};

/// SHA-256 over the forward and backward scripts, hex encoded.
///
/// A NUL separator keeps `("ab", "c")` and `("a", "bc")` distinct.
pub fn pair_checksum(up_script: &str, down_script: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(up_script.as_bytes());
    hasher.update([0u8]);
    hasher.update(down_script.as_bytes());
    format!("{:x}", hasher.finalize())
}
