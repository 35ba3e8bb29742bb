//! Log entries and the chunks that hold them.
//!
//! A stream stores its entries in a sequence of chunks. The [`Chunk`] trait
//! is the boundary between the store and the chunk encoding: the instance
//! only ever creates chunks through an injected [`ChunkFactory`].
//!
//! [`MemChunk`] is the default implementation. Entries are appended to a
//! mutable head block; once the head reaches `block_size` bytes it is cut
//! into an immutable, reference-counted block. Readers take a snapshot of the
//! block list (cheap `Arc` clones plus a copy of the head) so their iterators
//! stay valid after the stream lock is released.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ChunkError;
use crate::iter::{ChunkEntryIterator, Direction};
use crate::matcher::LineFilter;

/// Bytes accounted per entry in addition to its line (the timestamp).
const ENTRY_OVERHEAD: usize = 8;

/// A single log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Nanoseconds since the Unix epoch.
    pub timestamp: u64,
    /// The log line.
    pub line: String,
}

impl Entry {
    /// Creates a new entry.
    pub fn new(timestamp: u64, line: impl Into<String>) -> Self {
        Self {
            timestamp,
            line: line.into(),
        }
    }

    /// Returns the number of bytes this entry accounts for in a chunk.
    pub fn size(&self) -> usize {
        self.line.len() + ENTRY_OVERHEAD
    }
}

/// An appendable container of time-ordered entries.
pub trait Chunk: Send + Sync + fmt::Debug {
    /// Returns `true` if `entry` can be appended without cutting a new chunk.
    fn space_for(&self, entry: &Entry) -> bool;

    /// Appends an entry.
    ///
    /// # Errors
    ///
    /// - [`ChunkError::Closed`] if the chunk was closed
    /// - [`ChunkError::OutOfOrder`] if `entry` is older than the newest entry
    fn append(&mut self, entry: &Entry) -> Result<(), ChunkError>;

    /// Returns the `(oldest, newest)` timestamps, or `None` when empty.
    fn bounds(&self) -> Option<(u64, u64)>;

    /// Returns the number of entries.
    fn size(&self) -> usize;

    /// Returns the number of bytes accounted for by the entries.
    fn bytes(&self) -> usize;

    /// Returns how full the chunk is, between `0.0` and `1.0`.
    fn utilization(&self) -> f64;

    /// Seals the chunk. Further appends fail.
    fn close(&mut self);

    /// Returns `true` once the chunk has been closed.
    fn is_closed(&self) -> bool;

    /// Serializes the chunk into its transfer format.
    ///
    /// # Errors
    ///
    /// Returns a [`ChunkError`] if serialization or compression fails.
    fn encode(&self) -> Result<Vec<u8>, ChunkError>;

    /// Returns an owned iterator over entries in `[from, through)` that pass
    /// every line filter.
    fn iterator(
        &self,
        from: u64,
        through: u64,
        direction: Direction,
        filters: &Arc<[LineFilter]>,
    ) -> ChunkEntryIterator;
}

/// Zero-argument constructor for empty chunks.
pub type ChunkFactory = Arc<dyn Fn() -> Box<dyn Chunk> + Send + Sync>;

/// The default in-memory chunk.
#[derive(Debug)]
pub struct MemChunk {
    /// Cut blocks, oldest first.
    blocks: Vec<Arc<[Entry]>>,
    /// Entries not yet cut into a block.
    head: Vec<Entry>,
    head_bytes: usize,
    bytes: usize,
    entries: usize,
    closed: bool,
    block_size: usize,
    blocks_per_chunk: usize,
}

/// Borrowed form written by [`MemChunk::encode`].
#[derive(Serialize)]
struct EncodedChunkRef<'a> {
    block_size: usize,
    blocks_per_chunk: usize,
    blocks: Vec<&'a [Entry]>,
}

/// Owned form read by [`MemChunk::decode`].
#[derive(Deserialize)]
struct EncodedChunk {
    block_size: usize,
    blocks_per_chunk: usize,
    blocks: Vec<Vec<Entry>>,
}

impl MemChunk {
    /// Creates an empty chunk.
    ///
    /// # Arguments
    ///
    /// * `block_size` - Head size in bytes at which a block is cut
    /// * `blocks_per_chunk` - Number of cut blocks after which the chunk is full
    pub fn new(block_size: usize, blocks_per_chunk: usize) -> Self {
        Self {
            blocks: Vec::new(),
            head: Vec::new(),
            head_bytes: 0,
            bytes: 0,
            entries: 0,
            closed: false,
            block_size: block_size.max(1),
            blocks_per_chunk: blocks_per_chunk.max(1),
        }
    }

    /// Returns a [`ChunkFactory`] producing `MemChunk`s of the given shape.
    pub fn factory(block_size: usize, blocks_per_chunk: usize) -> ChunkFactory {
        Arc::new(move || Box::new(MemChunk::new(block_size, blocks_per_chunk)) as Box<dyn Chunk>)
    }

    /// Decodes bytes produced by [`Chunk::encode`] into a closed chunk.
    ///
    /// # Errors
    ///
    /// - [`ChunkError::Compression`] if the bytes are not valid Snappy
    /// - [`ChunkError::Decode`] if the payload is malformed or out of order
    pub fn decode(bytes: &[u8]) -> Result<Self, ChunkError> {
        let raw = snap::raw::Decoder::new()
            .decompress_vec(bytes)
            .map_err(|source| ChunkError::Compression { source })?;
        let encoded: EncodedChunk =
            serde_json::from_slice(&raw).map_err(|e| ChunkError::Decode {
                reason: e.to_string(),
            })?;

        let mut chunk = MemChunk::new(encoded.block_size, encoded.blocks_per_chunk);
        let mut newest = None;
        for block in encoded.blocks {
            for entry in &block {
                if newest.is_some_and(|n| entry.timestamp < n) {
                    return Err(ChunkError::Decode {
                        reason: format!("entry at {} is out of order", entry.timestamp),
                    });
                }
                newest = Some(entry.timestamp);
                chunk.bytes += entry.size();
            }
            chunk.entries += block.len();
            if !block.is_empty() {
                chunk.blocks.push(Arc::from(block));
            }
        }
        chunk.closed = true;
        Ok(chunk)
    }

    /// Returns the number of cut blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn newest(&self) -> Option<u64> {
        self.head
            .last()
            .or_else(|| self.blocks.last().and_then(|b| b.last()))
            .map(|e| e.timestamp)
    }

    fn oldest(&self) -> Option<u64> {
        self.blocks
            .first()
            .and_then(|b| b.first())
            .or_else(|| self.head.first())
            .map(|e| e.timestamp)
    }

    fn cut_block(&mut self) {
        if self.head.is_empty() {
            return;
        }
        let block = std::mem::take(&mut self.head);
        self.blocks.push(Arc::from(block));
        self.head_bytes = 0;
    }
}

impl Chunk for MemChunk {
    fn space_for(&self, _entry: &Entry) -> bool {
        !self.closed && self.blocks.len() < self.blocks_per_chunk
    }

    fn append(&mut self, entry: &Entry) -> Result<(), ChunkError> {
        if self.closed {
            return Err(ChunkError::Closed);
        }
        if let Some(newest) = self.newest()
            && entry.timestamp < newest
        {
            return Err(ChunkError::OutOfOrder {
                timestamp: entry.timestamp,
                newest,
            });
        }

        let size = entry.size();
        self.head.push(entry.clone());
        self.head_bytes += size;
        self.bytes += size;
        self.entries += 1;

        if self.head_bytes >= self.block_size {
            self.cut_block();
        }
        Ok(())
    }

    fn bounds(&self) -> Option<(u64, u64)> {
        Some((self.oldest()?, self.newest()?))
    }

    fn size(&self) -> usize {
        self.entries
    }

    fn bytes(&self) -> usize {
        self.bytes
    }

    #[allow(clippy::cast_precision_loss)]
    fn utilization(&self) -> f64 {
        let capacity = self.block_size * self.blocks_per_chunk;
        (self.bytes as f64 / capacity as f64).min(1.0)
    }

    fn close(&mut self) {
        self.cut_block();
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn encode(&self) -> Result<Vec<u8>, ChunkError> {
        let mut blocks: Vec<&[Entry]> = self.blocks.iter().map(AsRef::as_ref).collect();
        if !self.head.is_empty() {
            blocks.push(&self.head);
        }
        let json = serde_json::to_vec(&EncodedChunkRef {
            block_size: self.block_size,
            blocks_per_chunk: self.blocks_per_chunk,
            blocks,
        })
        .map_err(|source| ChunkError::Encode { source })?;

        snap::raw::Encoder::new()
            .compress_vec(&json)
            .map_err(|source| ChunkError::Compression { source })
    }

    fn iterator(
        &self,
        from: u64,
        through: u64,
        direction: Direction,
        filters: &Arc<[LineFilter]>,
    ) -> ChunkEntryIterator {
        let mut blocks = self.blocks.clone();
        if !self.head.is_empty() {
            blocks.push(Arc::from(self.head.as_slice()));
        }
        ChunkEntryIterator::new(blocks, from, through, direction, Arc::clone(filters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_filters() -> Arc<[LineFilter]> {
        Arc::from(Vec::new())
    }

    fn timestamps(iter: ChunkEntryIterator) -> Vec<u64> {
        iter.map(|e| e.timestamp).collect()
    }

    #[test]
    fn test_append_and_bounds() {
        let mut chunk = MemChunk::new(1024, 4);
        assert_eq!(chunk.bounds(), None);

        chunk.append(&Entry::new(10, "a")).unwrap();
        chunk.append(&Entry::new(10, "b")).unwrap();
        chunk.append(&Entry::new(20, "c")).unwrap();

        assert_eq!(chunk.bounds(), Some((10, 20)));
        assert_eq!(chunk.size(), 3);
        assert_eq!(chunk.bytes(), 3 * (1 + ENTRY_OVERHEAD));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut chunk = MemChunk::new(1024, 4);
        chunk.append(&Entry::new(20, "a")).unwrap();

        let err = chunk.append(&Entry::new(10, "b")).unwrap_err();
        assert!(matches!(
            err,
            ChunkError::OutOfOrder {
                timestamp: 10,
                newest: 20
            }
        ));
        assert_eq!(chunk.size(), 1);
    }

    #[test]
    fn test_closed_chunk_rejects_appends() {
        let mut chunk = MemChunk::new(1024, 4);
        chunk.append(&Entry::new(1, "a")).unwrap();
        chunk.close();

        assert!(chunk.is_closed());
        assert!(!chunk.space_for(&Entry::new(2, "b")));
        assert!(matches!(
            chunk.append(&Entry::new(2, "b")),
            Err(ChunkError::Closed)
        ));
    }

    #[test]
    fn test_blocks_are_cut_and_chunk_fills_up() {
        // Each entry is 10 bytes, so every second entry cuts a 20 byte block.
        let mut chunk = MemChunk::new(20, 2);
        let entry = |ts| Entry::new(ts, "xx");

        chunk.append(&entry(1)).unwrap();
        chunk.append(&entry(2)).unwrap();
        assert_eq!(chunk.block_count(), 1);
        assert!(chunk.space_for(&entry(3)));

        chunk.append(&entry(3)).unwrap();
        chunk.append(&entry(4)).unwrap();
        assert_eq!(chunk.block_count(), 2);
        assert!(!chunk.space_for(&entry(5)));
        assert!((chunk.utilization() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_iterator_range_and_direction() {
        let mut chunk = MemChunk::new(20, 10);
        for ts in 1..=6 {
            chunk.append(&Entry::new(ts, "xx")).unwrap();
        }

        let forward = chunk.iterator(2, 6, Direction::Forward, &no_filters());
        assert_eq!(timestamps(forward), vec![2, 3, 4, 5]);

        let backward = chunk.iterator(2, 6, Direction::Backward, &no_filters());
        assert_eq!(timestamps(backward), vec![5, 4, 3, 2]);
    }

    #[test]
    fn test_iterator_is_a_snapshot() {
        let mut chunk = MemChunk::new(1024, 10);
        chunk.append(&Entry::new(1, "a")).unwrap();
        let iter = chunk.iterator(0, u64::MAX, Direction::Forward, &no_filters());

        chunk.append(&Entry::new(2, "b")).unwrap();
        assert_eq!(timestamps(iter), vec![1]);
    }

    #[test]
    fn test_iterator_applies_line_filters() {
        let mut chunk = MemChunk::new(1024, 10);
        chunk.append(&Entry::new(1, "GET /health")).unwrap();
        chunk.append(&Entry::new(2, "POST /login")).unwrap();
        chunk.append(&Entry::new(3, "GET /login")).unwrap();

        let filters: Arc<[LineFilter]> = Arc::from(vec![
            LineFilter::Contains("login".to_string()),
            LineFilter::NotContains("POST".to_string()),
        ]);
        let lines: Vec<String> = chunk
            .iterator(0, u64::MAX, Direction::Forward, &filters)
            .map(|e| e.line)
            .collect();
        assert_eq!(lines, vec!["GET /login"]);
    }

    #[test]
    fn test_encode_decode() {
        let mut chunk = MemChunk::new(20, 10);
        for ts in 1..=5 {
            chunk.append(&Entry::new(ts, format!("line {ts}"))).unwrap();
        }

        let bytes = chunk.encode().unwrap();
        let decoded = MemChunk::decode(&bytes).unwrap();

        assert!(decoded.is_closed());
        assert_eq!(decoded.size(), 5);
        assert_eq!(decoded.bytes(), chunk.bytes());
        assert_eq!(decoded.bounds(), Some((1, 5)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(MemChunk::decode(b"not snappy at all").is_err());

        let json = br#"{"block_size":10,"blocks_per_chunk":1,"blocks":[[{"timestamp":5,"line":"a"},{"timestamp":1,"line":"b"}]]}"#;
        let bytes = snap::raw::Encoder::new().compress_vec(json).unwrap();
        assert!(matches!(
            MemChunk::decode(&bytes),
            Err(ChunkError::Decode { .. })
        ));
    }
}
