//! Signed ledger transactions
//!
//! A transaction is signed over its canonical serialization: a JSON
//! object with keys in the fixed order `{from, to, data, amount,
//! timestamp}`. The id and signature are excluded from the signed
//! payload so that signing does not change it.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{KeyDirectory, NodeId, NodeKeypair};
use crate::util::now_ms;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction is missing {0}")]
    MissingField(&'static str),
    #[error("Signature does not verify against {0}")]
    BadSignature(NodeId),
}

/// A transfer record pending inclusion in a block.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub from: NodeId,
    pub to: String,
    pub data: String,
    pub amount: f64,
    pub timestamp: i64,
    pub signature: Option<String>,
}

/// Canonical signing payload; field declaration order is the wire order.
#[derive(Serialize)]
struct SigningPayload<'a> {
    from: &'a NodeId,
    to: &'a str,
    data: &'a str,
    amount: f64,
    timestamp: i64,
}

impl Transaction {
    /// Create an unsigned transaction stamped with the current time.
    pub fn new(from: NodeId, to: impl Into<String>, data: impl Into<String>, amount: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            from,
            to: to.into(),
            data: data.into(),
            amount,
            timestamp: now_ms(),
            signature: None,
        }
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let payload = SigningPayload {
            from: &self.from,
            to: &self.to,
            data: &self.data,
            amount: self.amount,
            timestamp: self.timestamp,
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    /// Sign with `keypair`, replacing any existing signature.
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        self.signature = Some(keypair.sign(&self.signing_bytes()));
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Check structural validity and, when a signature is present, that
    /// it verifies against `from`'s public key.
    pub fn validate(&self, keys: &KeyDirectory) -> Result<(), TransactionError> {
        if self.from.as_str().is_empty() {
            return Err(TransactionError::MissingField("from"));
        }
        if self.timestamp == 0 {
            return Err(TransactionError::MissingField("timestamp"));
        }
        if let Some(sig) = &self.signature {
            if !keys.verify(&self.from, &self.signing_bytes(), sig) {
                return Err(TransactionError::BadSignature(self.from.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory_with(kp: &NodeKeypair) -> KeyDirectory {
        let mut dir = KeyDirectory::new();
        dir.learn(kp.node_id(), kp.public_key()).unwrap();
        dir
    }

    #[test]
    fn test_sign_and_validate() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);

        let mut tx = Transaction::new(kp.node_id().clone(), "bob", "payload", 5.0);
        tx.sign(&kp);

        assert!(tx.is_signed());
        tx.validate(&dir).unwrap();
    }

    #[test]
    fn test_tampered_amount_fails() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);

        let mut tx = Transaction::new(kp.node_id().clone(), "bob", "payload", 5.0);
        tx.sign(&kp);
        tx.amount = 500.0;

        assert!(matches!(
            tx.validate(&dir),
            Err(TransactionError::BadSignature(_))
        ));
    }

    #[test]
    fn test_unsigned_is_structurally_valid() {
        let kp = NodeKeypair::generate();
        let tx = Transaction::new(kp.node_id().clone(), "bob", "x", 0.0);
        tx.validate(&KeyDirectory::new()).unwrap();
    }

    #[test]
    fn test_unknown_signer_fails() {
        let kp = NodeKeypair::generate();
        let mut tx = Transaction::new(kp.node_id().clone(), "bob", "x", 1.0);
        tx.sign(&kp);
        // Empty directory: the signature cannot be checked.
        assert!(tx.validate(&KeyDirectory::new()).is_err());
    }

    #[test]
    fn test_canonical_payload_key_order() {
        let kp = NodeKeypair::generate();
        let tx = Transaction::new(kp.node_id().clone(), "bob", "d", 2.5);
        let json = String::from_utf8(tx.signing_bytes()).unwrap();

        let from_pos = json.find("\"from\"").unwrap();
        let to_pos = json.find("\"to\"").unwrap();
        let data_pos = json.find("\"data\"").unwrap();
        let amount_pos = json.find("\"amount\"").unwrap();
        let ts_pos = json.find("\"timestamp\"").unwrap();
        assert!(from_pos < to_pos && to_pos < data_pos);
        assert!(data_pos < amount_pos && amount_pos < ts_pos);
    }

    #[test]
    fn test_wire_roundtrip() {
        let kp = NodeKeypair::generate();
        let mut tx = Transaction::new(kp.node_id().clone(), "bob", "d", 2.5);
        tx.sign(&kp);

        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, back);
    }
}
