//! Chunked transfer engine
//!
//! Tracks in-flight downloads against a hard concurrency cap, buffers
//! received chunks in a sparse index map, and verifies the reassembled
//! content against the hash from the original offer. Uploads are
//! tracked only as a counted resource; the actual chunk pumping happens
//! in a per-upload task owned by the node driver.

use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::catalog::FileOffer;
use super::chunker::reassemble;
use crate::crypto::{verify_bytes, NodeId};
use crate::util::now_ms;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Too many concurrent downloads")]
    TooManyTransfers,
    #[error("No offer known for file {0}")]
    UnknownOffer(Uuid),
    #[error("Download already active for file {0}")]
    AlreadyDownloading(Uuid),
    #[error("Advertiser {0} is not connected")]
    SourceOffline(NodeId),
    #[error("Too many concurrent uploads")]
    TooManyUploads,
}

/// Why a download ended without a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFailure {
    /// The advertising peer disconnected mid-transfer.
    SourceLost,
    /// The reassembled content did not match the offered hash.
    IntegrityFailure,
    /// The advertiser refused the request.
    Refused(String),
}

impl std::fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadFailure::SourceLost => write!(f, "source disconnected"),
            DownloadFailure::IntegrityFailure => write!(f, "content hash mismatch"),
            DownloadFailure::Refused(reason) => write!(f, "refused: {reason}"),
        }
    }
}

/// One in-flight download.
pub struct TransferState {
    pub file_id: Uuid,
    pub source_peer: NodeId,
    pub name: String,
    pub expected_hash: String,
    pub total_chunks: Option<u32>,
    pub chunk_size: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
    pub started_at: i64,
}

impl TransferState {
    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }
}

/// What applying a metadata frame or chunk produced.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// No matching download, or a duplicate/late chunk; state unchanged.
    Ignored,
    /// Chunk stored; transfer still incomplete.
    Progress { received: u32, total: u32 },
    /// All chunks arrived and the content verified.
    Completed {
        name: String,
        bytes: Vec<u8>,
        total_chunks: u32,
    },
    /// All chunks arrived but the content hash did not match.
    IntegrityFailure,
}

/// Download and upload bookkeeping for one node.
pub struct TransferEngine {
    downloads: HashMap<Uuid, TransferState>,
    max_downloads: usize,
    active_uploads: usize,
    max_uploads: usize,
}

impl TransferEngine {
    pub fn new(max_downloads: usize, max_uploads: usize) -> Self {
        Self {
            downloads: HashMap::new(),
            max_downloads,
            active_uploads: 0,
            max_uploads,
        }
    }

    pub fn active_downloads(&self) -> usize {
        self.downloads.len()
    }

    pub fn download(&self, file_id: &Uuid) -> Option<&TransferState> {
        self.downloads.get(file_id)
    }

    /// Stage a download of `offer`, enforcing the concurrency cap.
    pub fn begin_download(&mut self, offer: &FileOffer) -> Result<(), TransferError> {
        if self.downloads.contains_key(&offer.id) {
            return Err(TransferError::AlreadyDownloading(offer.id));
        }
        if self.downloads.len() >= self.max_downloads {
            return Err(TransferError::TooManyTransfers);
        }
        self.downloads.insert(
            offer.id,
            TransferState {
                file_id: offer.id,
                source_peer: offer.advertiser.clone(),
                name: offer.name.clone(),
                expected_hash: offer.sha256_hash.clone(),
                total_chunks: None,
                chunk_size: None,
                chunks: BTreeMap::new(),
                started_at: now_ms(),
            },
        );
        Ok(())
    }

    /// Apply the metadata frame that precedes the chunk stream.
    pub fn on_metadata(&mut self, file_id: &Uuid, total_chunks: u32, chunk_size: u32) -> ChunkOutcome {
        let Some(state) = self.downloads.get_mut(file_id) else {
            return ChunkOutcome::Ignored;
        };
        state.total_chunks = Some(total_chunks);
        state.chunk_size = Some(chunk_size);

        // An empty file has no chunks to wait for.
        if total_chunks == 0 {
            return self.try_complete(file_id);
        }
        ChunkOutcome::Ignored
    }

    /// Buffer one chunk. Duplicates are idempotent; chunks for unknown
    /// or finished transfers are dropped.
    pub fn on_chunk(&mut self, file_id: &Uuid, index: u32, data: Vec<u8>) -> ChunkOutcome {
        let Some(state) = self.downloads.get_mut(file_id) else {
            debug!(%file_id, index, "Dropping chunk for inactive transfer");
            return ChunkOutcome::Ignored;
        };
        if state.chunks.contains_key(&index) {
            return ChunkOutcome::Ignored;
        }
        state.chunks.insert(index, data);

        let received = state.received();
        match state.total_chunks {
            Some(total) if received >= total => self.try_complete(file_id),
            total => ChunkOutcome::Progress {
                received,
                total: total.unwrap_or(0),
            },
        }
    }

    /// Reassemble and verify a transfer whose chunk set is complete.
    fn try_complete(&mut self, file_id: &Uuid) -> ChunkOutcome {
        let Some(state) = self.downloads.remove(file_id) else {
            return ChunkOutcome::Ignored;
        };
        let total_chunks = state.received();
        let bytes = reassemble(&state.chunks);
        if verify_bytes(&state.expected_hash, &bytes) {
            ChunkOutcome::Completed {
                name: state.name,
                bytes,
                total_chunks,
            }
        } else {
            warn!(%file_id, "Reassembled content failed hash verification");
            ChunkOutcome::IntegrityFailure
        }
    }

    /// Drop a download; further chunks for it will be ignored.
    pub fn cancel(&mut self, file_id: &Uuid) -> bool {
        self.downloads.remove(file_id).is_some()
    }

    /// Drop every download sourced from `peer`, returning their file ids.
    pub fn on_peer_gone(&mut self, peer: &NodeId) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .downloads
            .values()
            .filter(|s| s.source_peer == *peer)
            .map(|s| s.file_id)
            .collect();
        for id in &ids {
            self.downloads.remove(id);
        }
        ids
    }

    pub fn active_uploads(&self) -> usize {
        self.active_uploads
    }

    /// Claim an upload slot.
    pub fn begin_upload(&mut self) -> Result<(), TransferError> {
        if self.active_uploads >= self.max_uploads {
            return Err(TransferError::TooManyUploads);
        }
        self.active_uploads += 1;
        Ok(())
    }

    /// Release an upload slot.
    pub fn end_upload(&mut self) {
        self.active_uploads = self.active_uploads.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256_hex;
    use crate::files::chunker::chunks;

    const CHUNK: usize = 65_536;

    fn offer_for(content: &[u8]) -> FileOffer {
        FileOffer {
            id: Uuid::new_v4(),
            name: "file.bin".into(),
            size: content.len() as u64,
            mime_type: "application/octet-stream".into(),
            sha256_hash: sha256_hex(content),
            advertiser: NodeId::new("aaaaaaaaaaaaaaaa"),
            seen_at: now_ms(),
        }
    }

    fn run_transfer(engine: &mut TransferEngine, offer: &FileOffer, content: &[u8]) -> ChunkOutcome {
        engine.begin_download(offer).unwrap();
        let total = crate::files::chunker::chunk_count(content.len() as u64, CHUNK);
        engine.on_metadata(&offer.id, total, CHUNK as u32);
        let mut last = ChunkOutcome::Ignored;
        for (index, chunk, _) in chunks(content, CHUNK) {
            last = engine.on_chunk(&offer.id, index, chunk.to_vec());
        }
        last
    }

    #[test]
    fn test_complete_download_verifies() {
        let content: Vec<u8> = (0..200_000).map(|i| (i % 256) as u8).collect();
        let offer = offer_for(&content);
        let mut engine = TransferEngine::new(3, 8);

        match run_transfer(&mut engine, &offer, &content) {
            ChunkOutcome::Completed { bytes, name, total_chunks } => {
                assert_eq!(bytes, content);
                assert_eq!(name, "file.bin");
                assert_eq!(total_chunks, 4);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(engine.active_downloads(), 0);
    }

    #[test]
    fn test_download_cap() {
        let mut engine = TransferEngine::new(3, 8);
        for _ in 0..3 {
            engine.begin_download(&offer_for(b"x")).unwrap();
        }
        assert!(matches!(
            engine.begin_download(&offer_for(b"y")),
            Err(TransferError::TooManyTransfers)
        ));
    }

    #[test]
    fn test_duplicate_chunk_is_idempotent() {
        let content = vec![9u8; CHUNK * 2];
        let offer = offer_for(&content);
        let mut engine = TransferEngine::new(3, 8);
        engine.begin_download(&offer).unwrap();
        engine.on_metadata(&offer.id, 2, CHUNK as u32);

        engine.on_chunk(&offer.id, 0, content[..CHUNK].to_vec());
        assert!(matches!(
            engine.on_chunk(&offer.id, 0, content[..CHUNK].to_vec()),
            ChunkOutcome::Ignored
        ));
        assert_eq!(engine.download(&offer.id).unwrap().received(), 1);
    }

    #[test]
    fn test_late_chunk_after_completion_ignored() {
        let content = vec![1u8; 100];
        let offer = offer_for(&content);
        let mut engine = TransferEngine::new(3, 8);

        assert!(matches!(
            run_transfer(&mut engine, &offer, &content),
            ChunkOutcome::Completed { .. }
        ));
        assert!(matches!(
            engine.on_chunk(&offer.id, 0, content.clone()),
            ChunkOutcome::Ignored
        ));
    }

    #[test]
    fn test_integrity_failure_discards_transfer() {
        let content = vec![1u8; 100];
        let mut offer = offer_for(&content);
        offer.sha256_hash = sha256_hex(b"something else");
        let mut engine = TransferEngine::new(3, 8);

        assert!(matches!(
            run_transfer(&mut engine, &offer, &content),
            ChunkOutcome::IntegrityFailure
        ));
        assert_eq!(engine.active_downloads(), 0);
    }

    #[test]
    fn test_empty_file_completes_on_metadata() {
        let offer = offer_for(b"");
        let mut engine = TransferEngine::new(3, 8);
        engine.begin_download(&offer).unwrap();

        match engine.on_metadata(&offer.id, 0, CHUNK as u32) {
            ChunkOutcome::Completed { bytes, .. } => assert!(bytes.is_empty()),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_source_disconnect_drops_downloads() {
        let mut engine = TransferEngine::new(3, 8);
        let offer_a = offer_for(b"a");
        let offer_b = offer_for(b"b");
        engine.begin_download(&offer_a).unwrap();
        engine.begin_download(&offer_b).unwrap();

        let dropped = engine.on_peer_gone(&NodeId::new("aaaaaaaaaaaaaaaa"));
        assert_eq!(dropped.len(), 2);
        assert_eq!(engine.active_downloads(), 0);
        // Cap slots are free again.
        engine.begin_download(&offer_for(b"c")).unwrap();
    }

    #[test]
    fn test_upload_slots() {
        let mut engine = TransferEngine::new(3, 2);
        engine.begin_upload().unwrap();
        engine.begin_upload().unwrap();
        assert!(matches!(engine.begin_upload(), Err(TransferError::TooManyUploads)));
        engine.end_upload();
        engine.begin_upload().unwrap();
    }
}
