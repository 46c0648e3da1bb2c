//! Ledger data model
//!
//! Transactions, hash-chained blocks, the append-only chain, and the
//! pending-transaction pool.

pub mod block;
pub mod chain;
pub mod mempool;
pub mod transaction;

pub use block::{Block, GENESIS_AUTHOR, GENESIS_PREVIOUS_HASH};
pub use chain::{Blockchain, ChainError};
pub use mempool::Mempool;
pub use transaction::{Transaction, TransactionError};
