//! Entry iterators and the cross-stream merge.
//!
//! Reading happens in three layers:
//!
//! - [`ChunkEntryIterator`] walks one chunk snapshot in either direction
//! - [`NonOverlappingIterator`] concatenates one stream's chunk iterators and
//!   tags every entry with the stream's labels
//! - [`HeapIterator`] merges any number of stream iterators lazily, keeping
//!   one pending entry per source in a [`BinaryHeap`]
//!
//! The merge never materializes its inputs. Memory is bounded by the number
//! of sources, not by the number of entries.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chunk::Entry;
use crate::error::{QueryError, Result};
use crate::matcher::{LineFilter, line_matches};
use crate::query::{QueryResponse, StreamBatch};

/// Order in which a query returns entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Oldest first.
    #[default]
    Forward,
    /// Newest first.
    Backward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => f.write_str("forward"),
            Self::Backward => f.write_str("backward"),
        }
    }
}

impl FromStr for Direction {
    type Err = QueryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forward" | "fwd" => Ok(Self::Forward),
            "backward" | "bwd" => Ok(Self::Backward),
            _ => Err(QueryError::InvalidDirection {
                input: s.to_string(),
            }),
        }
    }
}

/// An entry tagged with the rendered labels of its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledEntry {
    /// The stream's label set, rendered once and shared.
    pub labels: Arc<str>,
    /// The entry.
    pub entry: Entry,
}

/// A fallible, lazily evaluated sequence of labeled entries.
pub trait EntryIterator: Send {
    /// Returns the next entry, an error, or `None` when exhausted.
    fn next_entry(&mut self) -> Option<Result<LabeledEntry>>;

    /// Releases resources held by the iterator.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while closing.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: EntryIterator + ?Sized> EntryIterator for Box<T> {
    fn next_entry(&mut self) -> Option<Result<LabeledEntry>> {
        (**self).next_entry()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Iterator over one chunk snapshot.
///
/// Holds shared references to the chunk's blocks, so it outlives any lock
/// that was held while it was created.
#[derive(Debug)]
pub struct ChunkEntryIterator {
    /// Blocks in iteration order, each with the index range inside the
    /// requested time range.
    blocks: Vec<(Arc<[Entry]>, Range<usize>)>,
    current: usize,
    direction: Direction,
    filters: Arc<[LineFilter]>,
}

impl ChunkEntryIterator {
    /// Creates an iterator over `blocks` (oldest first) restricted to
    /// `[from, through)`.
    pub fn new(
        blocks: Vec<Arc<[Entry]>>,
        from: u64,
        through: u64,
        direction: Direction,
        filters: Arc<[LineFilter]>,
    ) -> Self {
        let mut blocks: Vec<(Arc<[Entry]>, Range<usize>)> = blocks
            .into_iter()
            .filter_map(|block| {
                let start = block.partition_point(|e| e.timestamp < from);
                let end = block.partition_point(|e| e.timestamp < through);
                (start < end).then(|| (block, start..end))
            })
            .collect();
        if direction == Direction::Backward {
            blocks.reverse();
        }
        Self {
            blocks,
            current: 0,
            direction,
            filters,
        }
    }
}

impl Iterator for ChunkEntryIterator {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            let (block, range) = self.blocks.get_mut(self.current)?;
            let idx = match self.direction {
                Direction::Forward => range.next(),
                Direction::Backward => range.next_back(),
            };
            let Some(idx) = idx else {
                self.current += 1;
                continue;
            };
            let entry = &block[idx];
            if line_matches(&self.filters, &entry.line) {
                return Some(entry.clone());
            }
        }
    }
}

/// Concatenation of one stream's chunk iterators.
///
/// Callers hand over chunk iterators whose time ranges do not overlap, so
/// chaining them in the right order yields a sorted sequence.
#[derive(Debug)]
pub struct NonOverlappingIterator {
    labels: Arc<str>,
    chunks: VecDeque<ChunkEntryIterator>,
}

impl NonOverlappingIterator {
    /// Creates an iterator that drains `chunks` front to back.
    ///
    /// `chunks` must already be in the query's direction.
    pub fn new(labels: Arc<str>, chunks: Vec<ChunkEntryIterator>) -> Self {
        Self {
            labels,
            chunks: chunks.into(),
        }
    }

    /// Returns the rendered labels of the stream.
    pub fn labels(&self) -> &str {
        &self.labels
    }
}

impl EntryIterator for NonOverlappingIterator {
    fn next_entry(&mut self) -> Option<Result<LabeledEntry>> {
        loop {
            let chunk = self.chunks.front_mut()?;
            if let Some(entry) = chunk.next() {
                return Some(Ok(LabeledEntry {
                    labels: Arc::clone(&self.labels),
                    entry,
                }));
            }
            self.chunks.pop_front();
        }
    }

    fn close(&mut self) -> Result<()> {
        self.chunks.clear();
        Ok(())
    }
}

/// One pending entry in the merge heap.
struct HeapItem {
    entry: LabeledEntry,
    source: usize,
    direction: Direction,
}

impl HeapItem {
    /// Orders items by emission order: the item that must be emitted first
    /// compares as `Less`.
    fn emission_cmp(&self, other: &Self) -> Ordering {
        let by_time = match self.direction {
            Direction::Forward => self.entry.entry.timestamp.cmp(&other.entry.entry.timestamp),
            Direction::Backward => other.entry.entry.timestamp.cmp(&self.entry.entry.timestamp),
        };
        by_time
            .then_with(|| self.entry.labels.cmp(&other.entry.labels))
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.emission_cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the first-to-emit item is on top.
        other.emission_cmp(self)
    }
}

/// Lazy k-way merge of entry iterators.
///
/// Forward output is non-decreasing in timestamp, backward output is
/// non-increasing. Entries with equal timestamps are ordered by labels, then
/// by source position, and each source only ever has one entry in the heap,
/// so the relative order of a single source is preserved.
///
/// When a source fails, the entry already popped is still returned, the
/// error follows on the next call, and the merge then ends.
pub struct HeapIterator {
    sources: Vec<Box<dyn EntryIterator>>,
    heap: BinaryHeap<HeapItem>,
    direction: Direction,
    primed: bool,
    done: bool,
    pending_error: Option<crate::error::RivuletError>,
}

impl HeapIterator {
    /// Creates a merge over `sources`.
    ///
    /// Nothing is read until the first call to
    /// [`EntryIterator::next_entry`].
    pub fn new(sources: Vec<Box<dyn EntryIterator>>, direction: Direction) -> Self {
        let capacity = sources.len();
        Self {
            sources,
            heap: BinaryHeap::with_capacity(capacity),
            direction,
            primed: false,
            done: false,
            pending_error: None,
        }
    }

    /// Returns the number of merged sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    fn prime(&mut self) -> Result<()> {
        for source in 0..self.sources.len() {
            self.advance(source)?;
        }
        Ok(())
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        if let Some(next) = self.sources[source].next_entry() {
            self.heap.push(HeapItem {
                entry: next?,
                source,
                direction: self.direction,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for HeapIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapIterator")
            .field("sources", &self.sources.len())
            .field("pending", &self.heap.len())
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl EntryIterator for HeapIterator {
    fn next_entry(&mut self) -> Option<Result<LabeledEntry>> {
        if self.done {
            return None;
        }
        if !self.primed {
            self.primed = true;
            if let Err(e) = self.prime() {
                self.done = true;
                return Some(Err(e));
            }
        }
        if let Some(err) = self.pending_error.take() {
            self.done = true;
            return Some(Err(err));
        }

        let Some(item) = self.heap.pop() else {
            self.done = true;
            return None;
        };
        if let Err(e) = self.advance(item.source) {
            self.pending_error = Some(e);
        }
        Some(Ok(item.entry))
    }

    fn close(&mut self) -> Result<()> {
        self.done = true;
        self.heap.clear();
        let mut first_err = None;
        for source in &mut self.sources {
            if let Err(e) = source.close()
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Pulls up to `size` entries from `iter` and groups them per label set.
///
/// Groups appear in the order their first entry was read; entries keep their
/// iteration order inside a group. Returns the batch and the number of
/// entries it holds, which is `0` once the iterator is exhausted.
///
/// # Errors
///
/// Returns the first error produced by `iter`.
pub fn read_batch(iter: &mut dyn EntryIterator, size: u32) -> Result<(QueryResponse, u32)> {
    let mut streams: Vec<StreamBatch> = Vec::new();
    let mut slots: HashMap<Arc<str>, usize> = HashMap::new();
    let mut count = 0u32;

    while count < size {
        let Some(next) = iter.next_entry() else {
            break;
        };
        let LabeledEntry { labels, entry } = next?;
        let slot = *slots.entry(Arc::clone(&labels)).or_insert_with(|| {
            streams.push(StreamBatch {
                labels: labels.to_string(),
                entries: Vec::new(),
            });
            streams.len() - 1
        });
        streams[slot].entries.push(entry);
        count += 1;
    }

    Ok((QueryResponse { streams }, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChunkError, RivuletError};

    fn stream(labels: &str, timestamps: &[u64]) -> Box<dyn EntryIterator> {
        let entries: Vec<Entry> = timestamps
            .iter()
            .map(|&ts| Entry::new(ts, format!("{labels}-{ts}")))
            .collect();
        let chunk = ChunkEntryIterator::new(
            vec![Arc::from(entries)],
            0,
            u64::MAX,
            Direction::Forward,
            Arc::from(Vec::new()),
        );
        Box::new(NonOverlappingIterator::new(Arc::from(labels), vec![chunk]))
    }

    fn backward(labels: &str, timestamps: &[u64]) -> Box<dyn EntryIterator> {
        let entries: Vec<Entry> = timestamps
            .iter()
            .map(|&ts| Entry::new(ts, format!("{labels}-{ts}")))
            .collect();
        let chunk = ChunkEntryIterator::new(
            vec![Arc::from(entries)],
            0,
            u64::MAX,
            Direction::Backward,
            Arc::from(Vec::new()),
        );
        Box::new(NonOverlappingIterator::new(Arc::from(labels), vec![chunk]))
    }

    fn drain(iter: &mut dyn EntryIterator) -> Vec<LabeledEntry> {
        let mut out = Vec::new();
        while let Some(next) = iter.next_entry() {
            out.push(next.unwrap());
        }
        out
    }

    struct Failing {
        emitted: bool,
    }

    impl EntryIterator for Failing {
        fn next_entry(&mut self) -> Option<Result<LabeledEntry>> {
            if self.emitted {
                return Some(Err(RivuletError::Chunk(ChunkError::Closed)));
            }
            self.emitted = true;
            Some(Ok(LabeledEntry {
                labels: Arc::from("{f=\"1\"}"),
                entry: Entry::new(1, "first"),
            }))
        }
    }

    #[test]
    fn test_chunk_iterator_spans_blocks() {
        let blocks: Vec<Arc<[Entry]>> = vec![
            Arc::from(vec![Entry::new(1, "a"), Entry::new(2, "b")]),
            Arc::from(vec![Entry::new(3, "c"), Entry::new(4, "d")]),
        ];
        let iter =
            ChunkEntryIterator::new(blocks.clone(), 2, 4, Direction::Forward, Arc::from(Vec::new()));
        assert_eq!(iter.map(|e| e.timestamp).collect::<Vec<_>>(), vec![2, 3]);

        let iter = ChunkEntryIterator::new(blocks, 0, 100, Direction::Backward, Arc::from(Vec::new()));
        assert_eq!(
            iter.map(|e| e.timestamp).collect::<Vec<_>>(),
            vec![4, 3, 2, 1]
        );
    }

    #[test]
    fn test_non_overlapping_concatenates_chunks() {
        let first = ChunkEntryIterator::new(
            vec![Arc::from(vec![Entry::new(1, "a")])],
            0,
            u64::MAX,
            Direction::Forward,
            Arc::from(Vec::new()),
        );
        let second = ChunkEntryIterator::new(
            vec![Arc::from(vec![Entry::new(5, "b")])],
            0,
            u64::MAX,
            Direction::Forward,
            Arc::from(Vec::new()),
        );
        let mut iter = NonOverlappingIterator::new(Arc::from("{a=\"1\"}"), vec![first, second]);
        let out = drain(&mut iter);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].entry.timestamp, 1);
        assert_eq!(out[1].entry.timestamp, 5);
        assert_eq!(&*out[1].labels, "{a=\"1\"}");
    }

    #[test]
    fn test_heap_merge_forward() {
        let mut heap = HeapIterator::new(
            vec![
                stream("a", &[1, 4, 7]),
                stream("b", &[2, 5, 8]),
                stream("c", &[3, 6, 9]),
            ],
            Direction::Forward,
        );
        let ts: Vec<u64> = drain(&mut heap).iter().map(|e| e.entry.timestamp).collect();
        assert_eq!(ts, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn test_heap_merge_backward() {
        let mut heap = HeapIterator::new(
            vec![backward("a", &[1, 4, 7]), backward("b", &[2, 5, 8])],
            Direction::Backward,
        );
        let ts: Vec<u64> = drain(&mut heap).iter().map(|e| e.entry.timestamp).collect();
        assert_eq!(ts, vec![8, 7, 5, 4, 2, 1]);
    }

    #[test]
    fn test_heap_merge_ties_are_stable() {
        let mut heap = HeapIterator::new(
            vec![stream("b", &[1, 1]), stream("a", &[1])],
            Direction::Forward,
        );
        let out = drain(&mut heap);
        let lines: Vec<&str> = out.iter().map(|e| e.entry.line.as_str()).collect();
        // Equal timestamps: labels decide across streams, and the two "b"
        // entries keep their original order.
        assert_eq!(lines, vec!["a-1", "b-1", "b-1"]);
        assert_eq!(&*out[1].labels, "b");
    }

    #[test]
    fn test_heap_merge_empty_sources() {
        let mut heap = HeapIterator::new(vec![stream("a", &[]), stream("b", &[3])], Direction::Forward);
        assert_eq!(drain(&mut heap).len(), 1);

        let mut empty = HeapIterator::new(Vec::new(), Direction::Forward);
        assert!(empty.next_entry().is_none());
    }

    #[test]
    fn test_heap_merge_propagates_errors() {
        let mut heap = HeapIterator::new(
            vec![
                Box::new(Failing { emitted: false }) as Box<dyn EntryIterator>,
                stream("a", &[5]),
            ],
            Direction::Forward,
        );
        let first = heap.next_entry().unwrap().unwrap();
        assert_eq!(first.entry.line, "first");
        assert!(heap.next_entry().unwrap().is_err());
        assert!(heap.next_entry().is_none());
    }

    #[test]
    fn test_read_batch_groups_by_labels() {
        let mut heap = HeapIterator::new(
            vec![stream("a", &[1, 3, 5]), stream("b", &[2, 4])],
            Direction::Forward,
        );

        let (batch, count) = read_batch(&mut heap, 4).unwrap();
        assert_eq!(count, 4);
        assert_eq!(batch.streams.len(), 2);
        assert_eq!(batch.streams[0].labels, "a");
        assert_eq!(
            batch.streams[0]
                .entries
                .iter()
                .map(|e| e.timestamp)
                .collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(batch.streams[1].entries.len(), 2);

        let (batch, count) = read_batch(&mut heap, 4).unwrap();
        assert_eq!(count, 1);
        assert_eq!(batch.streams[0].entries[0].timestamp, 5);

        let (batch, count) = read_batch(&mut heap, 4).unwrap();
        assert_eq!(count, 0);
        assert!(batch.streams.is_empty());
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("forward".parse::<Direction>().unwrap(), Direction::Forward);
        assert_eq!("BACKWARD".parse::<Direction>().unwrap(), Direction::Backward);
        assert!("sideways".parse::<Direction>().is_err());
    }
}
