//! Read-path request and response types, and the batch sender.
//!
//! A query resolves to one merged [`EntryIterator`] (see
//! [`crate::iter::HeapIterator`]). [`send_batches`] drains that iterator in
//! pages of at most [`QUERY_BATCH_SIZE`] entries and hands each page to a
//! caller-supplied [`BatchSink`]. Sending happens without any store lock
//! held, so a slow sink only slows down its own query.
//!
//! # Example Usage
//!
//! ```rust
//! use rivulet::iter::{Direction, HeapIterator};
//! use rivulet::query::{send_batches, QueryContext, QueryResponse, QUERY_BATCH_SIZE};
//!
//! let mut merged = HeapIterator::new(Vec::new(), Direction::Forward);
//! let mut batches: Vec<QueryResponse> = Vec::new();
//!
//! let stats = send_batches(&QueryContext::new(), &mut merged, &mut batches, 0, QUERY_BATCH_SIZE)?;
//! assert_eq!(stats.total_lines_sent, 0);
//! assert!(batches.is_empty());
//! # Ok::<(), rivulet::error::RivuletError>(())
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunk::Entry;
use crate::error::{QueryError, Result};
use crate::iter::{Direction, EntryIterator, read_batch};
use crate::matcher::{Matcher, Selector};

/// Maximum number of entries sent in one batch.
pub const QUERY_BATCH_SIZE: u32 = 128;

/// Error returned by a [`BatchSink`].
pub type SendError = Box<dyn std::error::Error + Send + Sync>;

/// A range query over the streams matching a selector.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Stream matchers and line filters.
    pub selector: Selector,
    /// Inclusive start, in nanoseconds.
    pub start: u64,
    /// Exclusive end, in nanoseconds.
    pub end: u64,
    /// Order of the returned entries.
    pub direction: Direction,
    /// Maximum number of entries returned; `0` means unbounded.
    pub limit: u32,
}

impl QueryRequest {
    /// Creates a forward, unbounded query over `[start, end)`.
    pub fn new(selector: Selector, start: u64, end: u64) -> Self {
        Self {
            selector,
            start,
            end,
            direction: Direction::Forward,
            limit: 0,
        }
    }

    /// Sets the direction.
    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the entry limit.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Checks that the time range is not inverted.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start > end`.
    pub fn validate(&self) -> std::result::Result<(), QueryError> {
        if self.start > self.end {
            return Err(QueryError::InvalidTimeRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}

/// Entries of one stream inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBatch {
    /// The stream's rendered label set.
    pub labels: String,
    /// Entries in query order.
    pub entries: Vec<Entry>,
}

/// One batch of query results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Per-stream groups, in the order their first entry was read.
    pub streams: Vec<StreamBatch>,
}

impl QueryResponse {
    /// Returns the number of entries across all streams.
    pub fn entry_count(&self) -> usize {
        self.streams.iter().map(|s| s.entries.len()).sum()
    }
}

/// Request for label names, or for the values of one label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequest {
    /// The label whose values are wanted.
    pub name: Option<String>,
    /// Return values of `name` instead of label names.
    pub values: bool,
}

impl LabelRequest {
    /// Requests every label name.
    pub fn names() -> Self {
        Self::default()
    }

    /// Requests the values of `name`.
    pub fn values_of(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            values: true,
        }
    }
}

/// Sorted label names or values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelResponse {
    /// The names or values, sorted and deduplicated.
    pub values: Vec<String>,
}

/// Request for the label sets of streams matching any of several groups.
#[derive(Debug, Clone, Default)]
pub struct SeriesRequest {
    /// Matcher groups; a stream is returned if it satisfies every matcher
    /// of at least one group.
    pub groups: Vec<Vec<Matcher>>,
}

/// The label set of one series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesIdentifier {
    /// Label name to value, sorted by name.
    pub labels: BTreeMap<String, String>,
}

/// Deduplicated series, sorted by label set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesResponse {
    /// The matching series.
    pub series: Vec<SeriesIdentifier>,
}

/// Counters collected while serving a query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Chunks overlapping the query range across matched streams.
    pub total_chunks_matched: u64,
    /// Entries handed to the sink.
    pub total_lines_sent: u64,
    /// Batches handed to the sink.
    pub total_batches: u64,
}

/// Cancellation handle for a running query.
///
/// Clones share the same cancellation flag, so a transport can keep one
/// clone and cancel the query from another thread.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl QueryContext {
    /// Creates a context without a deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that is done `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Creates a context that is done at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(deadline),
        }
    }

    /// Cancels the query and every clone of this context.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.cancelled.load(Ordering::Acquire) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Receiver of query batches.
pub trait BatchSink {
    /// Delivers one batch.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the query.
    fn send(&mut self, batch: QueryResponse) -> std::result::Result<(), SendError>;
}

impl BatchSink for Vec<QueryResponse> {
    fn send(&mut self, batch: QueryResponse) -> std::result::Result<(), SendError> {
        self.push(batch);
        Ok(())
    }
}

/// Adapts a closure into a [`BatchSink`].
pub struct FnSink<F>(pub F);

impl<F> BatchSink for FnSink<F>
where
    F: FnMut(QueryResponse) -> std::result::Result<(), SendError>,
{
    fn send(&mut self, batch: QueryResponse) -> std::result::Result<(), SendError> {
        (self.0)(batch)
    }
}

/// Drains `iter` into `sink` in batches of at most `page_size` entries.
///
/// With a non-zero `limit`, at most `limit` entries are sent in total and
/// no batch exceeds `min(page_size, remaining)`. The loop stops when the
/// iterator is exhausted, the limit is reached, or `ctx` is done. A done
/// context is not an error: the stats gathered so far are returned.
///
/// # Errors
///
/// - Any error produced by `iter`
/// - [`QueryError::Send`] if the sink rejects a batch
pub fn send_batches(
    ctx: &QueryContext,
    iter: &mut dyn EntryIterator,
    sink: &mut dyn BatchSink,
    limit: u32,
    page_size: u32,
) -> Result<QueryStats> {
    let page_size = page_size.max(1);
    let mut stats = QueryStats::default();
    let mut sent = 0u32;

    loop {
        if ctx.is_done() {
            debug!(lines = stats.total_lines_sent, "query context done, stopping");
            break;
        }

        let want = if limit == 0 {
            page_size
        } else {
            if sent >= limit {
                break;
            }
            page_size.min(limit - sent)
        };

        let (batch, size) = read_batch(iter, want)?;
        if size == 0 {
            break;
        }

        sink.send(batch)
            .map_err(|source| QueryError::Send { source })?;
        sent += size;
        stats.total_lines_sent += u64::from(size);
        stats.total_batches += 1;
    }

    Ok(stats)
}
