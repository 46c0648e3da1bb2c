//! File sharing module
//!
//! Handles catalogs of shared and offered files, chunking, and the
//! chunked transfer engine.

pub mod catalog;
pub mod chunker;
pub mod transfer;

pub use catalog::{FileEntry, FileOffer, OfferBoard, OfferOutcome, SharedCatalog};
pub use chunker::{chunk_count, chunks, reassemble};
pub use transfer::{ChunkOutcome, DownloadFailure, TransferEngine, TransferError, TransferState};
