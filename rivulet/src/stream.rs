//! A single label-set-identified log stream.
//!
//! A [`Stream`] owns a list of chunks (oldest first, the last one is the
//! head) and the tailers wired to it. It has no lock of its own for the
//! chunk list; the instance's stream-map lock guards it. The tailer set sits
//! behind a small mutex so tailers can be attached under the instance's
//! shared lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::chunk::{Chunk, ChunkFactory, Entry, MemChunk};
use crate::config::InstanceConfig;
use crate::error::{ChunkError, StreamError};
use crate::iter::{ChunkEntryIterator, Direction, NonOverlappingIterator};
use crate::labels::{Fingerprint, Labels};
use crate::mapper::LabelsLookup;
use crate::matcher::LineFilter;
use crate::tailer::Tailer;

/// In-memory state of one stream.
pub struct Stream {
    fp: Fingerprint,
    labels: Labels,
    /// Rendered once; shared with every entry a query returns.
    labels_string: Arc<str>,
    factory: ChunkFactory,
    chunks: Vec<Box<dyn Chunk>>,
    tailers: Mutex<HashMap<u32, Arc<Tailer>>>,
    /// Timestamp of the newest stored entry.
    last_timestamp: Option<u64>,
    max_returned_errors: usize,
}

impl Stream {
    /// Creates an empty stream.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Instance configuration
    /// * `fp` - The mapped fingerprint the instance keys this stream by
    /// * `labels` - The canonical label set
    /// * `factory` - Constructor for new head chunks
    pub fn new(cfg: &InstanceConfig, fp: Fingerprint, labels: Labels, factory: ChunkFactory) -> Self {
        let labels_string: Arc<str> = Arc::from(labels.to_string());
        Self {
            fp,
            labels,
            labels_string,
            factory,
            chunks: Vec::new(),
            tailers: Mutex::new(HashMap::new()),
            last_timestamp: None,
            max_returned_errors: cfg.max_returned_stream_errors,
        }
    }

    /// Returns the mapped fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fp
    }

    /// Returns the label set.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Returns the rendered label set.
    pub fn labels_string(&self) -> &str {
        &self.labels_string
    }

    /// Returns the number of chunks, including the head.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns the number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.chunks.iter().map(|c| c.size()).sum()
    }

    /// Returns the timestamp of the newest stored entry.
    pub fn last_timestamp(&self) -> Option<u64> {
        self.last_timestamp
    }

    /// Appends `entries` in order.
    ///
    /// A new head chunk is cut when the current head is closed, has no
    /// space left, or the entry crosses a synchronization boundary (see
    /// [`Stream::cut_for_sync`]). An entry older than the newest stored entry
    /// is rejected; rejections do not stop the loop. Stored entries are then
    /// offered to every open tailer.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::EntriesRejected`] if at least one entry was
    /// rejected. The other entries are stored regardless.
    pub fn push(
        &mut self,
        entries: &[Entry],
        sync_period: Duration,
        sync_min_utilization: f64,
    ) -> Result<(), StreamError> {
        let mut stored: Vec<Entry> = Vec::with_capacity(entries.len());
        let mut ignored = 0usize;
        let mut last_err: Option<ChunkError> = None;
        let mut details: Vec<String> = Vec::new();

        for entry in entries {
            let result = self.append(entry, sync_period, sync_min_utilization);
            match result {
                Ok(()) => stored.push(entry.clone()),
                Err(err) => {
                    ignored += 1;
                    if details.len() < self.max_returned_errors {
                        details.push(format!(
                            "entry with timestamp {} ignored, reason: '{err}'",
                            entry.timestamp
                        ));
                    }
                    last_err = Some(err);
                }
            }
        }

        if !stored.is_empty() {
            self.notify_tailers(&stored);
        }

        match last_err {
            None => Ok(()),
            Some(last) => {
                warn!(
                    stream = %self.labels_string,
                    ignored,
                    total = entries.len(),
                    "entries rejected"
                );
                Err(StreamError::EntriesRejected {
                    stream: self.labels_string.to_string(),
                    ignored,
                    total: entries.len(),
                    last,
                    details,
                })
            }
        }
    }

    fn append(
        &mut self,
        entry: &Entry,
        sync_period: Duration,
        sync_min_utilization: f64,
    ) -> Result<(), ChunkError> {
        if let Some(newest) = self.last_timestamp
            && entry.timestamp < newest
        {
            return Err(ChunkError::OutOfOrder {
                timestamp: entry.timestamp,
                newest,
            });
        }

        let cut = match self.chunks.last() {
            None => true,
            Some(head) => {
                head.is_closed()
                    || !head.space_for(entry)
                    || self.cut_for_sync(head.as_ref(), entry.timestamp, sync_period, sync_min_utilization)
            }
        };
        if cut {
            if let Some(head) = self.chunks.last_mut() {
                head.close();
            }
            self.chunks.push((self.factory)());
            debug!(stream = %self.labels_string, chunks = self.chunks.len(), "cut new chunk");
        }

        let Some(head) = self.chunks.last_mut() else {
            return Err(ChunkError::Closed);
        };
        head.append(entry)?;
        self.last_timestamp = Some(entry.timestamp);
        Ok(())
    }

    /// Returns `true` if `timestamp` crosses a synchronization boundary.
    ///
    /// Boundaries are multiples of `period`, shifted by the stream's
    /// fingerprint so that streams do not all cut at once. A crossing only
    /// cuts when the head's utilization is above `min_utilization`; a
    /// non-positive `min_utilization` always cuts. A zero period disables
    /// synchronization.
    fn cut_for_sync(&self, head: &dyn Chunk, timestamp: u64, period: Duration, min_utilization: f64) -> bool {
        let Some(prev) = self.last_timestamp else {
            return false;
        };
        let period = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
        if period == 0 {
            return false;
        }

        let jitter = self.fp.value() % period;
        let current = timestamp.wrapping_add(jitter) % period;
        let previous = prev.wrapping_add(jitter) % period;
        if current >= previous {
            return false;
        }
        min_utilization <= 0.0 || head.utilization() > min_utilization
    }

    /// Appends an encoded chunk received from another instance.
    ///
    /// The chunk is stored closed; the next push cuts a fresh head. Returns
    /// the number of entries the chunk holds.
    ///
    /// # Errors
    ///
    /// Returns a [`ChunkError`] if the bytes cannot be decoded.
    pub fn consume_chunk(&mut self, bytes: &[u8]) -> Result<usize, ChunkError> {
        let chunk = MemChunk::decode(bytes)?;
        let size = chunk.size();
        if let Some((_, newest)) = chunk.bounds() {
            self.last_timestamp = Some(self.last_timestamp.map_or(newest, |ts| ts.max(newest)));
        }
        self.chunks.push(Box::new(chunk));
        Ok(size)
    }

    /// Returns the number of chunks overlapping `[from, through)`.
    pub fn chunks_in_range(&self, from: u64, through: u64) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.bounds().is_some_and(|(min, max)| max >= from && min < through))
            .count()
    }

    /// Returns an owned iterator over entries in `[from, through)`.
    ///
    /// Chunks are visited in time order (reversed for backward queries).
    /// Chunks whose time ranges overlap, as a transferred chunk can, are
    /// merged into one sorted snapshot first.
    pub fn iterator(
        &self,
        from: u64,
        through: u64,
        direction: Direction,
        filters: &Arc<[LineFilter]>,
    ) -> NonOverlappingIterator {
        let mut selected: Vec<(u64, u64, &dyn Chunk)> = self
            .chunks
            .iter()
            .filter_map(|c| {
                let (min, max) = c.bounds()?;
                (max >= from && min < through).then_some((min, max, c.as_ref()))
            })
            .collect();
        selected.sort_by_key(|(min, _, _)| *min);

        let mut runs: Vec<Vec<&dyn Chunk>> = Vec::new();
        let mut run_max = 0u64;
        for (min, max, chunk) in selected {
            let overlaps = min < run_max;
            if overlaps && let Some(run) = runs.last_mut() {
                run.push(chunk);
                run_max = run_max.max(max);
            } else {
                runs.push(vec![chunk]);
                run_max = max;
            }
        }
        if direction == Direction::Backward {
            runs.reverse();
        }

        let iters = runs
            .into_iter()
            .map(|run| match run.as_slice() {
                [chunk] => chunk.iterator(from, through, direction, filters),
                _ => merge_overlapping(&run, from, through, direction, filters),
            })
            .collect();
        NonOverlappingIterator::new(Arc::clone(&self.labels_string), iters)
    }

    /// Returns `true` if `tailer` follows this stream.
    pub fn matches_tailer(&self, tailer: &Tailer) -> bool {
        !tailer.is_closed() && tailer.is_watching_labels(&self.labels)
    }

    /// Wires `tailer` into this stream.
    pub fn add_tailer(&self, tailer: &Arc<Tailer>) {
        self.tailers.lock().insert(tailer.id(), Arc::clone(tailer));
    }

    /// Returns the number of tailers wired into this stream.
    pub fn tailer_count(&self) -> usize {
        self.tailers.lock().len()
    }

    fn notify_tailers(&self, stored: &[Entry]) {
        let mut tailers = self.tailers.lock();
        tailers.retain(|_, tailer| {
            if tailer.is_closed() {
                return false;
            }
            tailer.send(&self.labels_string, stored);
            true
        });
    }
}

/// Reads every chunk of `run` forward and sorts the union by timestamp.
///
/// The sort is stable, so on equal timestamps entries of the chunk with the
/// older first entry come first. Filters are applied while reading.
fn merge_overlapping(
    run: &[&dyn Chunk],
    from: u64,
    through: u64,
    direction: Direction,
    filters: &Arc<[LineFilter]>,
) -> ChunkEntryIterator {
    let mut merged: Vec<Entry> = run
        .iter()
        .flat_map(|c| c.iterator(from, through, Direction::Forward, filters))
        .collect();
    merged.sort_by_key(|e| e.timestamp);
    ChunkEntryIterator::new(vec![Arc::from(merged)], from, through, direction, Arc::from(Vec::new()))
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("fp", &self.fp)
            .field("labels", &self.labels_string)
            .field("chunks", &self.chunks.len())
            .field("last_timestamp", &self.last_timestamp)
            .finish_non_exhaustive()
    }
}

impl LabelsLookup for HashMap<Fingerprint, Stream> {
    fn labels_for(&self, fp: Fingerprint) -> Option<&Labels> {
        self.get(&fp).map(Stream::labels)
    }
}
