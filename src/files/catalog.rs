//! File catalogs
//!
//! `SharedCatalog` tracks files this node serves; `OfferBoard` tracks
//! files peers have announced. Offers are keyed by file id; when two
//! peers announce the same id, the most recent advertiser wins. All
//! offers from a peer are dropped when it disconnects.

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{sha256_hex, NodeId};
use crate::util::now_ms;

/// A locally shared file.
#[derive(Clone)]
pub struct FileEntry {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub sha256_hash: String,
    /// File content, shared with in-flight uploads.
    pub content: Arc<Vec<u8>>,
    pub shared_at: i64,
    pub download_count: u64,
}

/// A file announced by a remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOffer {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub sha256_hash: String,
    pub advertiser: NodeId,
    pub seen_at: i64,
}

/// Files this node shares.
#[derive(Default)]
pub struct SharedCatalog {
    entries: HashMap<Uuid, FileEntry>,
}

impl SharedCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash and register a file for sharing.
    pub fn share(&mut self, name: String, mime_type: String, content: Vec<u8>) -> FileEntry {
        let entry = FileEntry {
            id: Uuid::new_v4(),
            name,
            size: content.len() as u64,
            mime_type,
            sha256_hash: sha256_hex(&content),
            content: Arc::new(content),
            shared_at: now_ms(),
            download_count: 0,
        };
        self.entries.insert(entry.id, entry.clone());
        entry
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<FileEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&FileEntry> {
        self.entries.get(id)
    }

    pub fn record_download(&mut self, id: &Uuid) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.download_count += 1;
        }
    }

    /// Entries in the order they were shared.
    pub fn list(&self) -> Vec<FileEntry> {
        let mut entries: Vec<FileEntry> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.shared_at);
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of recording a remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Previously unknown file id.
    New,
    /// Known id, advertiser replaced by the most recent announcer.
    AdvertiserUpdated,
    /// Same id from the same advertiser; ignored.
    Duplicate,
}

/// Files peers have announced to us.
#[derive(Default)]
pub struct OfferBoard {
    offers: HashMap<Uuid, FileOffer>,
}

impl OfferBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, offer: FileOffer) -> OfferOutcome {
        match self.offers.get(&offer.id) {
            None => {
                self.offers.insert(offer.id, offer);
                OfferOutcome::New
            }
            Some(existing) if existing.advertiser == offer.advertiser => OfferOutcome::Duplicate,
            Some(_) => {
                self.offers.insert(offer.id, offer);
                OfferOutcome::AdvertiserUpdated
            }
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<FileOffer> {
        self.offers.remove(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&FileOffer> {
        self.offers.get(id)
    }

    /// Drop every offer advertised by `peer`, returning the file ids.
    pub fn drop_advertiser(&mut self, peer: &NodeId) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .offers
            .values()
            .filter(|o| o.advertiser == *peer)
            .map(|o| o.id)
            .collect();
        for id in &ids {
            self.offers.remove(id);
        }
        ids
    }

    pub fn list(&self) -> Vec<FileOffer> {
        let mut offers: Vec<FileOffer> = self.offers.values().cloned().collect();
        offers.sort_by_key(|o| o.seen_at);
        offers
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(id: Uuid, advertiser: &str) -> FileOffer {
        FileOffer {
            id,
            name: "f.bin".into(),
            size: 10,
            mime_type: "application/octet-stream".into(),
            sha256_hash: sha256_hex(b"f"),
            advertiser: NodeId::new(advertiser),
            seen_at: now_ms(),
        }
    }

    #[test]
    fn test_share_computes_hash_and_size() {
        let mut catalog = SharedCatalog::new();
        let entry = catalog.share("a.txt".into(), "text/plain".into(), b"hello".to_vec());
        assert_eq!(entry.size, 5);
        assert_eq!(entry.sha256_hash, sha256_hex(b"hello"));
        assert_eq!(entry.download_count, 0);
        assert!(catalog.get(&entry.id).is_some());
    }

    #[test]
    fn test_record_download() {
        let mut catalog = SharedCatalog::new();
        let entry = catalog.share("a".into(), "t".into(), vec![1]);
        catalog.record_download(&entry.id);
        catalog.record_download(&entry.id);
        assert_eq!(catalog.get(&entry.id).unwrap().download_count, 2);
    }

    #[test]
    fn test_duplicate_offer_ignored() {
        let mut board = OfferBoard::new();
        let id = Uuid::new_v4();
        assert_eq!(board.record(offer(id, "aaaa")), OfferOutcome::New);
        assert_eq!(board.record(offer(id, "aaaa")), OfferOutcome::Duplicate);
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_latest_advertiser_wins() {
        let mut board = OfferBoard::new();
        let id = Uuid::new_v4();
        board.record(offer(id, "aaaa"));
        assert_eq!(board.record(offer(id, "bbbb")), OfferOutcome::AdvertiserUpdated);
        assert_eq!(board.get(&id).unwrap().advertiser, NodeId::new("bbbb"));
    }

    #[test]
    fn test_drop_advertiser() {
        let mut board = OfferBoard::new();
        let keep = Uuid::new_v4();
        board.record(offer(Uuid::new_v4(), "gone"));
        board.record(offer(Uuid::new_v4(), "gone"));
        board.record(offer(keep, "stay"));

        let dropped = board.drop_advertiser(&NodeId::new("gone"));
        assert_eq!(dropped.len(), 2);
        assert_eq!(board.len(), 1);
        assert!(board.get(&keep).is_some());
    }
}
