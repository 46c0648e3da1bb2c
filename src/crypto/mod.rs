//! Cryptography module
//!
//! Provides node identity keypairs, signing, and content addressing.

pub mod hashing;
pub mod keys;

pub use hashing::{sha256_hex, verify_bytes};
pub use keys::{
    decode_public_key, verify_signature, KeyDirectory, KeyError, NodeId, NodeKeypair,
};
