//! Append-only blockchain
//!
//! The chain starts at the shared genesis block and only ever grows.
//! A candidate block is accepted only when it extends the current tip;
//! anything else is rejected, including otherwise-valid blocks from a
//! diverged history. Nodes that fall behind recover through catch-up
//! synchronization, not reorganization.

use thiserror::Error;

use super::block::Block;
use super::transaction::TransactionError;
use crate::crypto::{KeyDirectory, NodeId};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Block {0} is missing {1}")]
    MissingField(u64, &'static str),
    #[error("Block index {actual} does not extend height {expected}")]
    NotNextIndex { expected: u64, actual: u64 },
    #[error("Block {0} does not link to the current tip")]
    PreviousHashMismatch(u64),
    #[error("Block {0} hash does not match its contents")]
    HashMismatch(u64),
    #[error("Block {0} author signature does not verify")]
    BadSignature(u64),
    #[error("Invalid transaction in block {0}: {1}")]
    InvalidTransaction(u64, TransactionError),
    #[error("Block {0} contains an unsigned transaction from {1} not authored by the block author")]
    UnsignedForeignTransaction(u64, NodeId),
}

/// The local copy of the ledger.
pub struct Blockchain {
    blocks: Vec<Block>,
}

impl Blockchain {
    /// A fresh chain containing only the genesis block.
    pub fn new() -> Self {
        Self {
            blocks: vec![Block::genesis()],
        }
    }

    /// Number of blocks, genesis included. Equals the index the next
    /// block must carry.
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    pub fn tip(&self) -> &Block {
        // Invariant: never empty, genesis is always present.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Clone the suffix starting at `from_index`, for sync responses.
    pub fn slice_from(&self, from_index: u64) -> Vec<Block> {
        let start = (from_index as usize).min(self.blocks.len());
        self.blocks[start..].to_vec()
    }

    /// Check that `block` is a valid extension of the current tip.
    pub fn validate_next(&self, block: &Block, keys: &KeyDirectory) -> Result<(), ChainError> {
        if block.hash.is_empty() {
            return Err(ChainError::MissingField(block.index, "hash"));
        }
        if block.previous_hash.is_empty() {
            return Err(ChainError::MissingField(block.index, "previous_hash"));
        }
        if block.timestamp == 0 {
            return Err(ChainError::MissingField(block.index, "timestamp"));
        }
        if block.index != self.height() {
            return Err(ChainError::NotNextIndex {
                expected: self.height(),
                actual: block.index,
            });
        }
        if block.previous_hash != self.tip().hash {
            return Err(ChainError::PreviousHashMismatch(block.index));
        }
        if block.compute_hash() != block.hash {
            return Err(ChainError::HashMismatch(block.index));
        }
        if let Some(sig) = &block.signature {
            if !keys.verify(&block.author, &block.hash_payload(), sig) {
                return Err(ChainError::BadSignature(block.index));
            }
        }
        for tx in &block.transactions {
            tx.validate(keys)
                .map_err(|e| ChainError::InvalidTransaction(block.index, e))?;
            // Unsigned entries are only acceptable from the block's own
            // author; anything else would be unauthenticated.
            if !tx.is_signed() && tx.from != block.author {
                return Err(ChainError::UnsignedForeignTransaction(
                    block.index,
                    tx.from.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Validate and append, returning a reference to the new tip.
    pub fn append(&mut self, block: Block, keys: &KeyDirectory) -> Result<&Block, ChainError> {
        self.validate_next(&block, keys)?;
        self.blocks.push(block);
        Ok(self.tip())
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::ledger::transaction::Transaction;

    fn signed_block(chain: &Blockchain, kp: &NodeKeypair, txs: Vec<Transaction>) -> Block {
        let mut block = Block::new(
            chain.height(),
            txs,
            chain.tip().hash.clone(),
            kp.node_id().clone(),
        );
        block.sign(kp);
        block
    }

    fn directory_with(kp: &NodeKeypair) -> KeyDirectory {
        let mut dir = KeyDirectory::new();
        dir.learn(kp.node_id(), kp.public_key()).unwrap();
        dir
    }

    #[test]
    fn test_new_chain_is_genesis_only() {
        let chain = Blockchain::new();
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().index, 0);
    }

    #[test]
    fn test_append_valid_block() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let block = signed_block(&chain, &kp, Vec::new());
        chain.append(block, &dir).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip().index, 1);
        assert_eq!(chain.tip().previous_hash, chain.blocks()[0].hash);
    }

    #[test]
    fn test_reject_wrong_index() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let mut block = signed_block(&chain, &kp, Vec::new());
        block.index = 5;
        block.hash = block.compute_hash();
        block.sign(&kp);

        assert!(matches!(
            chain.append(block, &dir),
            Err(ChainError::NotNextIndex { expected: 1, actual: 5 })
        ));
    }

    #[test]
    fn test_reject_broken_link() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let mut block = signed_block(&chain, &kp, Vec::new());
        block.previous_hash = "f".repeat(64);
        block.hash = block.compute_hash();
        block.sign(&kp);

        assert!(matches!(
            chain.append(block, &dir),
            Err(ChainError::PreviousHashMismatch(1))
        ));
    }

    #[test]
    fn test_reject_tampered_hash() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let mut block = signed_block(&chain, &kp, Vec::new());
        block.nonce = 99;

        assert!(matches!(
            chain.append(block, &dir),
            Err(ChainError::HashMismatch(1))
        ));
    }

    #[test]
    fn test_reject_bad_author_signature() {
        let kp = NodeKeypair::generate();
        let other = NodeKeypair::generate();
        let mut dir = directory_with(&kp);
        dir.learn(other.node_id(), other.public_key()).unwrap();
        let mut chain = Blockchain::new();

        let mut block = Block::new(1, Vec::new(), chain.tip().hash.clone(), kp.node_id().clone());
        // Signed by someone other than the recorded author.
        block.signature = Some(other.sign(&block.hash_payload()));

        assert!(matches!(
            chain.append(block, &dir),
            Err(ChainError::BadSignature(1))
        ));
    }

    #[test]
    fn test_reject_unsigned_foreign_transaction() {
        let kp = NodeKeypair::generate();
        let stranger = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let tx = Transaction::new(stranger.node_id().clone(), "x", "y", 1.0);
        let block = signed_block(&chain, &kp, vec![tx]);

        assert!(matches!(
            chain.append(block, &dir),
            Err(ChainError::UnsignedForeignTransaction(1, _))
        ));
    }

    #[test]
    fn test_accept_unsigned_author_transaction() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();

        let tx = Transaction::new(kp.node_id().clone(), "x", "y", 1.0);
        let block = signed_block(&chain, &kp, vec![tx]);
        chain.append(block, &dir).unwrap();
    }

    #[test]
    fn test_slice_from() {
        let kp = NodeKeypair::generate();
        let dir = directory_with(&kp);
        let mut chain = Blockchain::new();
        chain.append(signed_block(&chain, &kp, Vec::new()), &dir).unwrap();
        chain.append(signed_block(&chain, &kp, Vec::new()), &dir).unwrap();

        assert_eq!(chain.slice_from(1).len(), 2);
        assert_eq!(chain.slice_from(3).len(), 0);
        assert_eq!(chain.slice_from(100).len(), 0);
    }
}
