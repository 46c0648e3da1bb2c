//! Content-addressed hashing using SHA-256
//!
//! Files and blocks are identified by their cryptographic hash,
//! encoded as a 64-character lowercase hex string. This enables:
//! - Integrity verification of reassembled downloads
//! - Hash-chaining of ledger blocks
//! - Tamper detection

use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of `data` as a 64-character hex string.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(digest)
}

/// Verify that `data` hashes to the claimed hex digest.
pub fn verify_bytes(expected_hex: &str, data: &[u8]) -> bool {
    sha256_hex(data) == expected_hex
}

/// Shorten a hex digest for log output.
pub fn short(hash_hex: &str) -> &str {
    &hash_hex[..hash_hex.len().min(8)]
}
