//! Hash-chained ledger blocks
//!
//! A block's hash is SHA-256 over its canonical serialization: a JSON
//! object with keys in the fixed order `{index, timestamp, transactions,
//! previousHash, nonce, author}`. The hash and signature fields are
//! excluded. The author signature, when present, covers the same bytes.

use serde::{Deserialize, Serialize};

use super::transaction::Transaction;
use crate::crypto::{sha256_hex, NodeId, NodeKeypair};
use crate::util::now_ms;

/// Previous-hash marker of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Author recorded on the genesis block.
pub const GENESIS_AUTHOR: &str = "genesis";

/// One committed batch of transactions.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    pub hash: String,
    pub nonce: u64,
    pub author: NodeId,
    pub signature: Option<String>,
}

/// Canonical hashing payload; field declaration order is the wire order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashPayload<'a> {
    index: u64,
    timestamp: i64,
    transactions: &'a [Transaction],
    previous_hash: &'a str,
    nonce: u64,
    author: &'a NodeId,
}

impl Block {
    /// The shared genesis block. Its timestamp is fixed at zero so that
    /// every node starts from an identical chain tip.
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            timestamp: 0,
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash: String::new(),
            nonce: 0,
            author: NodeId::new(GENESIS_AUTHOR),
            signature: None,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Build an unsigned block extending `previous_hash` at `index`.
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        author: NodeId,
    ) -> Self {
        let mut block = Self {
            index,
            timestamp: now_ms(),
            transactions,
            previous_hash,
            hash: String::new(),
            nonce: 0,
            author,
            signature: None,
        };
        block.hash = block.compute_hash();
        block
    }

    /// Bytes covered by the hash and the author signature.
    pub fn hash_payload(&self) -> Vec<u8> {
        let payload = HashPayload {
            index: self.index,
            timestamp: self.timestamp,
            transactions: &self.transactions,
            previous_hash: &self.previous_hash,
            nonce: self.nonce,
            author: &self.author,
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    /// Recompute the hash from the canonical payload.
    pub fn compute_hash(&self) -> String {
        sha256_hex(&self.hash_payload())
    }

    /// Sign the canonical payload as the author.
    pub fn sign(&mut self, keypair: &NodeKeypair) {
        self.signature = Some(keypair.sign(&self.hash_payload()));
    }

    pub fn transaction_ids(&self) -> impl Iterator<Item = &uuid::Uuid> {
        self.transactions.iter().map(|tx| &tx.id)
    }
}
