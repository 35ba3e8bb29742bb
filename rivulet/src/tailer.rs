//! Live tail subscriptions.
//!
//! A [`Tailer`] receives every entry pushed to a stream whose labels satisfy
//! its selector. Delivery goes through a bounded tokio channel and never
//! blocks the push path: when the consumer falls behind, the batch is dropped
//! and counted instead.
//!
//! Closing is detected out of band. Either the transport calls
//! [`Tailer::close`], or the receiver is dropped and the next send notices.
//! The instance sweeps closed tailers out of its registry lazily.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::chunk::Entry;
use crate::labels::Labels;
use crate::matcher::{Selector, line_matches};
use crate::query::StreamBatch;

/// A live subscription to newly pushed entries.
#[derive(Debug)]
pub struct Tailer {
    id: u32,
    selector: Selector,
    sender: mpsc::Sender<StreamBatch>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Tailer {
    /// Creates a tailer and the receiving end of its channel.
    ///
    /// # Arguments
    ///
    /// * `id` - Registry id, see [`TailerIds`]
    /// * `selector` - Stream matchers and line filters
    /// * `buffer` - Channel capacity in batches (at least one)
    pub fn new(id: u32, selector: Selector, buffer: usize) -> (Arc<Self>, mpsc::Receiver<StreamBatch>) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let tailer = Arc::new(Self {
            id,
            selector,
            sender,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        (tailer, receiver)
    }

    /// Returns the registry id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the selector this tailer follows.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Returns `true` if a stream with `labels` should feed this tailer.
    pub fn is_watching_labels(&self, labels: &Labels) -> bool {
        self.selector.matches_labels(labels)
    }

    /// Offers newly stored entries of one stream to the subscriber.
    ///
    /// Entries failing the line filters are removed first. If nothing is
    /// left, nothing is sent. A full channel drops the batch; a gone
    /// receiver closes the tailer.
    pub fn send(&self, labels: &str, entries: &[Entry]) {
        if self.is_closed() {
            return;
        }

        let entries: Vec<Entry> = entries
            .iter()
            .filter(|e| line_matches(&self.selector.filters, &e.line))
            .cloned()
            .collect();
        if entries.is_empty() {
            return;
        }

        let batch = StreamBatch {
            labels: labels.to_string(),
            entries,
        };
        match self.sender.try_send(batch) {
            Ok(()) => {}
            Err(TrySendError::Full(batch)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    tailer = self.id,
                    stream = %batch.labels,
                    entries = batch.entries.len(),
                    dropped,
                    "tailer buffer full, dropping entries"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!(tailer = self.id, "tail receiver gone, closing tailer");
                self.close();
            }
        }
    }

    /// Marks the tailer closed. It receives nothing afterwards.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` once closed or once the receiver was dropped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// Returns how many batches were dropped because the buffer was full.
    pub fn dropped_streams(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Monotonic tailer id allocator. Ids start at 1.
#[derive(Debug, Default)]
pub struct TailerIds(AtomicU32);

impl TailerIds {
    /// Creates an allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id.
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{LineFilter, Matcher};

    fn labels(items: &[(&str, &str)]) -> Labels {
        let pairs: Vec<(String, String)> = items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Labels::from_pairs(&pairs).unwrap()
    }

    #[test]
    fn test_watching_labels() {
        let (tailer, _rx) = Tailer::new(1, Selector::new(vec![Matcher::equal("job", "api")]), 4);
        assert!(tailer.is_watching_labels(&labels(&[("job", "api"), ("env", "prod")])));
        assert!(!tailer.is_watching_labels(&labels(&[("job", "web")])));
    }

    #[test]
    fn test_send_applies_line_filters() {
        let selector = Selector::new(vec![Matcher::equal("job", "api")])
            .with_filter(LineFilter::Contains("error".to_string()));
        let (tailer, mut rx) = Tailer::new(1, selector, 4);

        tailer.send(
            "{job=\"api\"}",
            &[Entry::new(1, "all good"), Entry::new(2, "error: boom")],
        );
        tailer.send("{job=\"api\"}", &[Entry::new(3, "still fine")]);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.entries, vec![Entry::new(2, "error: boom")]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_buffer_drops_and_counts() {
        let (tailer, mut rx) = Tailer::new(1, Selector::default(), 1);

        tailer.send("s", &[Entry::new(1, "a")]);
        tailer.send("s", &[Entry::new(2, "b")]);
        tailer.send("s", &[Entry::new(3, "c")]);

        assert_eq!(tailer.dropped_streams(), 2);
        assert!(!tailer.is_closed());
        assert_eq!(rx.try_recv().unwrap().entries[0].timestamp, 1);
    }

    #[test]
    fn test_dropped_receiver_closes() {
        let (tailer, rx) = Tailer::new(1, Selector::default(), 1);
        assert!(!tailer.is_closed());
        drop(rx);
        assert!(tailer.is_closed());

        let (tailer, _rx) = Tailer::new(2, Selector::default(), 1);
        tailer.close();
        assert!(tailer.is_closed());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = TailerIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }
}
