//! Node identity and signing keys
//!
//! Every node owns an ed25519 keypair generated at startup. The node's
//! address on the network (`NodeId`) is bound to the public key: it is
//! the first 16 hex characters of SHA-256(public key). Anyone holding
//! the key can recompute the id, so a peer cannot claim an id it does
//! not own the key for.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use super::hashing::sha256_hex;

/// Length of a node identifier in hex characters.
pub const NODE_ID_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid public key encoding")]
    InvalidKey,
    #[error("Invalid signature encoding")]
    InvalidSignature,
    #[error("Node id {claimed} does not match public key (expected {derived})")]
    BindingMismatch { claimed: NodeId, derived: NodeId },
}

/// Opaque node identifier used as the peer address throughout.
///
/// Ordinary nodes carry a 16-character hex id derived from their public
/// key; a handful of well-known ids (the genesis author) are plain
/// strings.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier bound to `key`.
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let digest = sha256_hex(key.as_bytes());
        Self(digest[..NODE_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// A node's ed25519 keypair and the identifier bound to it.
///
/// The secret half zeroizes on drop.
pub struct NodeKeypair {
    signing: SigningKey,
    node_id: NodeId,
}

impl NodeKeypair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let node_id = NodeId::from_public_key(&signing.verifying_key());
        Self { signing, node_id }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Public key as base64, the form carried in signal blobs.
    pub fn public_key_b64(&self) -> String {
        BASE64.encode(self.signing.verifying_key().as_bytes())
    }

    /// Sign `message`, returning the signature as base64.
    pub fn sign(&self, message: &[u8]) -> String {
        let sig = self.signing.sign(message);
        BASE64.encode(sig.to_bytes())
    }
}

/// Decode a base64 public key.
pub fn decode_public_key(b64: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64.decode(b64).map_err(|_| KeyError::InvalidKey)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| KeyError::InvalidKey)
}

/// Verify a base64 signature over `message` with `key`.
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(arr) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&arr)).is_ok()
}

/// Directory of public keys learned from peers.
///
/// Keys arrive through the session handshake (the offer/answer signal
/// blob) or are preseeded from configuration. `learn` enforces the
/// id-to-key binding, so a recorded key is always the one its id was
/// derived from.
#[derive(Default)]
pub struct KeyDirectory {
    keys: HashMap<NodeId, VerifyingKey>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` for `id` after checking the binding.
    pub fn learn(&mut self, id: &NodeId, key: VerifyingKey) -> Result<(), KeyError> {
        let derived = NodeId::from_public_key(&key);
        if derived != *id {
            return Err(KeyError::BindingMismatch {
                claimed: id.clone(),
                derived,
            });
        }
        self.keys.insert(id.clone(), key);
        Ok(())
    }

    /// Record a base64-encoded key for `id`.
    pub fn learn_b64(&mut self, id: &NodeId, key_b64: &str) -> Result<(), KeyError> {
        let key = decode_public_key(key_b64)?;
        self.learn(id, key)
    }

    pub fn get(&self, id: &NodeId) -> Option<&VerifyingKey> {
        self.keys.get(id)
    }

    /// Verify a base64 signature attributed to `id`.
    ///
    /// Unknown signers verify as false: a signature that cannot be
    /// checked is not accepted.
    pub fn verify(&self, id: &NodeId, message: &[u8], signature_b64: &str) -> bool {
        match self.keys.get(id) {
            Some(key) => verify_signature(key, message, signature_b64),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
