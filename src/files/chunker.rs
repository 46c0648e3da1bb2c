//! File chunking with a fixed chunk size
//!
//! Splits shared files into fixed-size chunks for transfer and
//! reassembles received chunks in index order. The final chunk carries
//! the remainder; no padding is applied.

use std::collections::BTreeMap;

/// Number of chunks a file of `size` bytes splits into.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64) as u32
}

/// The byte range of chunk `index` within a file of `len` bytes.
pub fn chunk_range(len: usize, index: u32, chunk_size: usize) -> std::ops::Range<usize> {
    let start = (index as usize) * chunk_size;
    let end = (start + chunk_size).min(len);
    start.min(len)..end
}

/// Iterate `(index, bytes, is_last)` over the chunks of `data`.
pub fn chunks(data: &[u8], chunk_size: usize) -> impl Iterator<Item = (u32, &[u8], bool)> {
    let total = chunk_count(data.len() as u64, chunk_size);
    (0..total).map(move |index| {
        let range = chunk_range(data.len(), index, chunk_size);
        (index, &data[range], index + 1 == total)
    })
}

/// Concatenate a complete sparse chunk map in index order.
pub fn reassemble(received: &BTreeMap<u32, Vec<u8>>) -> Vec<u8> {
    let mut out = Vec::with_capacity(received.values().map(Vec::len).sum());
    for chunk in received.values() {
        out.extend_from_slice(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHUNK: usize = 65_536;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, CHUNK), 0);
        assert_eq!(chunk_count(1, CHUNK), 1);
        assert_eq!(chunk_count(CHUNK as u64, CHUNK), 1);
        assert_eq!(chunk_count(CHUNK as u64 + 1, CHUNK), 2);
        // Three full chunks plus a 3072-byte tail.
        assert_eq!(chunk_count(3 * CHUNK as u64 + 3072, CHUNK), 4);
    }

    #[test]
    fn test_split_and_reassemble() {
        let data: Vec<u8> = (0..(3 * CHUNK + 3072)).map(|i| (i % 251) as u8).collect();

        let mut received = BTreeMap::new();
        let mut last_seen = None;
        for (index, chunk, is_last) in chunks(&data, CHUNK) {
            if is_last {
                assert_eq!(chunk.len(), 3072);
                last_seen = Some(index);
            } else {
                assert_eq!(chunk.len(), CHUNK);
            }
            received.insert(index, chunk.to_vec());
        }
        assert_eq!(received.len(), 4);
        assert_eq!(last_seen, Some(3));
        assert_eq!(reassemble(&received), data);
    }

    #[test]
    fn test_reassembly_is_order_independent() {
        let data = vec![7u8; 2 * CHUNK + 10];
        let mut received = BTreeMap::new();
        // Insert out of order; BTreeMap restores index order.
        for (index, chunk, _) in chunks(&data, CHUNK).collect::<Vec<_>>().into_iter().rev() {
            received.insert(index, chunk.to_vec());
        }
        assert_eq!(reassemble(&received), data);
    }

    #[test]
    fn test_exact_multiple_has_full_last_chunk() {
        let data = vec![1u8; 2 * CHUNK];
        let parts: Vec<_> = chunks(&data, CHUNK).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].1.len(), CHUNK);
        assert!(parts[1].2);
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        assert_eq!(chunks(&[], CHUNK).count(), 0);
    }
}
