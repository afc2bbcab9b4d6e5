//! Content checksums over a migration's reversible SQL pair.

use sha2::{Digest, Sha256};

use crate::migration::Migration;

/// Compute the checksum of a migration.
pub fn compute(migration: &Migration) -> String {
    compute_parts(migration.up_sql(), migration.down_sql())
}

/// Compute the checksum of an up/down pair.
///
/// The digest is SHA-256 over `up ‖ down`, hex encoded, where each half is
/// prefixed with its byte length as a little-endian `u64` so text cannot
/// shift from one half to the other unnoticed. A missing down half hashes the
/// same as an empty one.
pub fn compute_parts(up_sql: &str, down_sql: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    for part in [up_sql, down_sql.unwrap_or_default()] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Check a recorded checksum against the migration's current content.
pub fn verify(recorded: &str, migration: &Migration) -> bool {
    compute(migration) == recorded
}
