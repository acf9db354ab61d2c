//! Shared helpers used across the TabletGrid crates.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Stable identifier for a storage root path on a host.
///
/// Backends report the same value for a path across restarts, so the hash
/// only depends on the host and the path string. Zero is never returned.
pub fn path_hash(host: &str, root_path: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(b":");
    hasher.update(root_path.as_bytes());
    let digest = hasher.finalize();
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    // Keep it positive when exposed as a signed column.
    let hash = u64::from_be_bytes(buf) & (i64::MAX as u64);
    hash.max(1)
}
