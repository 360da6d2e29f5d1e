//! SHA-256 helpers.
//!
//! Used for filesystem object versions and for deriving the rater sampling
//! seed from an identifier.

use sha2::{Digest, Sha256};

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Derive a 64-bit seed from the first eight bytes of the SHA-256 digest.
pub fn seed_from_str(value: &str) -> u64 {
    let hash = Sha256::digest(value.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(bytes)
}
