//! Pending-transaction pool
//!
//! Keyed by transaction id, iterated in first-receipt order. Entries
//! leave the pool only when a block committing them is appended.

use std::collections::HashMap;
use uuid::Uuid;

use super::transaction::Transaction;

#[derive(Default)]
pub struct Mempool {
    order: Vec<Uuid>,
    txs: HashMap<Uuid, Transaction>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a transaction. Returns false when the id is already known.
    pub fn insert(&mut self, tx: Transaction) -> bool {
        if self.txs.contains_key(&tx.id) {
            return false;
        }
        self.order.push(tx.id);
        self.txs.insert(tx.id, tx);
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.txs.contains_key(id)
    }

    /// Clone up to `limit` transactions satisfying `eligible`, in
    /// first-receipt order. Entries stay pooled until committed.
    pub fn select(&self, limit: usize, eligible: impl Fn(&Transaction) -> bool) -> Vec<Transaction> {
        self.order
            .iter()
            .filter_map(|id| self.txs.get(id))
            .filter(|tx| eligible(tx))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove committed transaction ids.
    pub fn purge<'a>(&mut self, ids: impl Iterator<Item = &'a Uuid>) {
        for id in ids {
            self.txs.remove(id);
        }
        self.order.retain(|id| self.txs.contains_key(id));
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeId;

    fn tx(n: u8) -> Transaction {
        Transaction::new(NodeId::new(format!("{n:016x}")), "to", format!("d{n}"), 1.0)
    }

    #[test]
    fn test_duplicate_insert_ignored() {
        let mut pool = Mempool::new();
        let t = tx(1);
        assert!(pool.insert(t.clone()));
        assert!(!pool.insert(t));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_select_preserves_receipt_order() {
        let mut pool = Mempool::new();
        let (a, b, c) = (tx(1), tx(2), tx(3));
        pool.insert(a.clone());
        pool.insert(b.clone());
        pool.insert(c.clone());

        let picked = pool.select(2, |_| true);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].id, a.id);
        assert_eq!(picked[1].id, b.id);
    }

    #[test]
    fn test_select_skips_ineligible() {
        let mut pool = Mempool::new();
        let (a, b) = (tx(1), tx(2));
        pool.insert(a.clone());
        pool.insert(b.clone());

        let picked = pool.select(10, |t| t.id != a.id);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, b.id);
    }

    #[test]
    fn test_purge_removes_committed() {
        let mut pool = Mempool::new();
        let (a, b) = (tx(1), tx(2));
        pool.insert(a.clone());
        pool.insert(b.clone());

        pool.purge([a.id].iter());
        assert!(!pool.contains(&a.id));
        assert!(pool.contains(&b.id));
        assert_eq!(pool.select(10, |_| true)[0].id, b.id);
    }
}
