//! Per-tenant stream store.
//!
//! An [`Instance`] owns every stream of one tenant and answers pushes,
//! range queries, label and series metadata requests, and live tail
//! registrations.
//!
//! # Locking
//!
//! - The stream map, the fingerprint mapper and index additions share one
//!   `RwLock`. Pushes and chunk transfers take it exclusively; queries and
//!   tail wiring take it shared.
//! - The tailer registry has its own `RwLock`. When both are needed, the
//!   stream map lock is taken first.
//! - The inverted index locks itself, so label requests skip the stream map
//!   lock entirely.
//!
//! Query iterators are collected under the shared lock and drained after it
//! is released, so a slow reader never blocks pushes.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunk::{ChunkFactory, Entry};
use crate::config::InstanceConfig;
use crate::error::{PushErrors, QueryError, Result, RivuletError};
use crate::index::InvertedIndex;
use crate::iter::{EntryIterator, HeapIterator};
use crate::labels::{Fingerprint, Labels, fast_fingerprint};
use crate::limiter::{Limiter, StaticLimiter};
use crate::mapper::FingerprintMapper;
use crate::matcher::{LineFilter, Matcher, Selector, split_filters_and_matchers};
use crate::query::{
    BatchSink, LabelRequest, LabelResponse, QueryContext, QueryRequest, QueryStats,
    SeriesIdentifier, SeriesRequest, SeriesResponse, StreamBatch, send_batches,
};
use crate::stream::Stream;
use crate::tailer::{Tailer, TailerIds};

/// Entries for one label set inside a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStream {
    /// Label name/value pairs, in any order.
    pub labels: Vec<(String, String)>,
    /// Entries, oldest first.
    pub entries: Vec<Entry>,
}

impl PushStream {
    /// Creates a push stream from borrowed label pairs.
    pub fn new(labels: &[(&str, &str)], entries: Vec<Entry>) -> Self {
        Self {
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            entries,
        }
    }
}

/// A batch of streams pushed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// The streams, processed in order.
    pub streams: Vec<PushStream>,
}

/// Snapshot of an instance's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetrics {
    /// Streams created since the instance started.
    pub streams_created_total: u64,
    /// Streams currently held in memory.
    pub memory_streams: u64,
    /// Chunks currently held in memory.
    pub memory_chunks: u64,
}

struct StreamState {
    streams: HashMap<Fingerprint, Stream>,
    mapper: FingerprintMapper,
}

/// The stream store of one tenant.
pub struct Instance {
    cfg: InstanceConfig,
    tenant: String,
    state: RwLock<StreamState>,
    index: InvertedIndex,
    tailers: RwLock<HashMap<u32, Arc<Tailer>>>,
    tailer_ids: TailerIds,
    limiter: Arc<dyn Limiter>,
    factory: ChunkFactory,

    streams_created_total: AtomicU64,
    memory_streams: AtomicU64,
    memory_chunks: AtomicU64,
}

impl Instance {
    /// Creates an empty instance.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Chunking, sync and query settings
    /// * `tenant` - The tenant this instance serves
    /// * `factory` - Constructor for new chunks
    /// * `limiter` - Admission control for new streams
    pub fn new(
        cfg: InstanceConfig,
        tenant: impl Into<String>,
        factory: ChunkFactory,
        limiter: Arc<dyn Limiter>,
    ) -> Self {
        Self {
            cfg,
            tenant: tenant.into(),
            state: RwLock::new(StreamState {
                streams: HashMap::new(),
                mapper: FingerprintMapper::new(),
            }),
            index: InvertedIndex::new(),
            tailers: RwLock::new(HashMap::new()),
            tailer_ids: TailerIds::new(),
            limiter,
            factory,
            streams_created_total: AtomicU64::new(0),
            memory_streams: AtomicU64::new(0),
            memory_chunks: AtomicU64::new(0),
        }
    }

    /// Creates an instance using [`crate::chunk::MemChunk`]s and a
    /// [`StaticLimiter`] built from `cfg`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use rivulet::config::InstanceConfig;
    /// use rivulet::instance::Instance;
    ///
    /// let instance = Instance::from_config(InstanceConfig::default(), "tenant-a");
    /// assert_eq!(instance.tenant(), "tenant-a");
    /// assert_eq!(instance.stream_count(), 0);
    /// ```
    pub fn from_config(cfg: InstanceConfig, tenant: impl Into<String>) -> Self {
        let factory = cfg.chunk_factory();
        let limiter = Arc::new(StaticLimiter::new(cfg.max_streams_per_user));
        Self::new(cfg, tenant, factory, limiter)
    }

    /// Returns the tenant id.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Returns the configuration.
    pub fn config(&self) -> &InstanceConfig {
        &self.cfg
    }

    /// Appends every stream of `req`.
    ///
    /// The whole batch is processed under one exclusive lock. A failing
    /// stream does not stop the batch.
    ///
    /// # Errors
    ///
    /// - With exactly one failing stream, that stream's error
    /// - With several, [`RivuletError::Push`] holding every failure; its
    ///   status is the one of the last failure
    pub fn push(&self, req: &PushRequest) -> Result<()> {
        let mut failures: Vec<RivuletError> = Vec::new();
        {
            let mut state = self.state.write();
            for push in &req.streams {
                if let Err(err) = self.push_stream(&mut state, push) {
                    debug!(tenant = %self.tenant, error = %err, "stream push failed");
                    failures.push(err);
                }
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => {
                warn!(
                    tenant = %self.tenant,
                    failed = failures.len(),
                    total = req.streams.len(),
                    "push partially failed"
                );
                Err(PushErrors {
                    errors: failures,
                    total: req.streams.len(),
                }
                .into())
            }
        }
    }

    fn push_stream(&self, state: &mut StreamState, push: &PushStream) -> Result<()> {
        let labels = Labels::from_pairs(&push.labels)?;
        let stream = self.get_or_create_stream(state, labels)?;

        let before = stream.chunk_count();
        let result = stream.push(&push.entries, self.cfg.sync_period, self.cfg.sync_min_utilization);
        let created = stream.chunk_count().saturating_sub(before);
        self.memory_chunks.fetch_add(created as u64, Ordering::Relaxed);

        result.map_err(Into::into)
    }

    /// Appends an encoded chunk to the stream with `labels`, creating the
    /// stream if needed.
    ///
    /// # Errors
    ///
    /// Fails on invalid labels, admission rejection, or undecodable bytes.
    pub fn consume_chunk(&self, labels: &[(String, String)], bytes: &[u8]) -> Result<()> {
        let labels = Labels::from_pairs(labels)?;
        let mut state = self.state.write();
        let stream = self.get_or_create_stream(&mut state, labels)?;
        let entries = stream.consume_chunk(bytes)?;
        self.memory_chunks.fetch_add(1, Ordering::Relaxed);
        debug!(
            tenant = %self.tenant,
            stream = %stream.labels_string(),
            entries,
            "consumed transferred chunk"
        );
        Ok(())
    }

    fn get_or_create_stream<'a>(
        &self,
        state: &'a mut StreamState,
        labels: Labels,
    ) -> Result<&'a mut Stream> {
        let raw = fast_fingerprint(&labels);
        self.stream_for(state, raw, labels)
    }

    /// Resolves `raw` through the mapper and returns the stream, creating it
    /// if it does not exist. Must be called with the state lock held.
    fn stream_for<'a>(
        &self,
        state: &'a mut StreamState,
        raw: Fingerprint,
        labels: Labels,
    ) -> Result<&'a mut Stream> {
        let StreamState { streams, mapper } = state;
        let fp = mapper.map_fp(raw, &labels, &*streams)?;
        let current = streams.len();

        match streams.entry(fp) {
            MapEntry::Occupied(entry) => Ok(entry.into_mut()),
            MapEntry::Vacant(entry) => {
                self.limiter
                    .assert_max_streams_per_user(&self.tenant, current)?;

                let labels = self.index.add(&labels, fp);
                let stream = Stream::new(&self.cfg, fp, labels, Arc::clone(&self.factory));
                self.add_tailers_to_new_stream(&stream);

                self.streams_created_total.fetch_add(1, Ordering::Relaxed);
                self.memory_streams.fetch_add(1, Ordering::Relaxed);
                debug!(
                    tenant = %self.tenant,
                    fingerprint = %fp,
                    stream = %stream.labels_string(),
                    "created stream"
                );
                Ok(entry.insert(stream))
            }
        }
    }

    /// Runs a range query and streams the result into `sink`.
    ///
    /// Per-stream iterators are collected under the shared lock, then merged
    /// and sent without any lock held.
    ///
    /// # Errors
    ///
    /// - [`QueryError::InvalidTimeRange`] for an inverted range
    /// - [`QueryError::StreamMissing`] if the index and the stream map
    ///   disagree
    /// - [`QueryError::Send`] if the sink fails
    pub fn query(
        &self,
        ctx: &QueryContext,
        req: &QueryRequest,
        sink: &mut dyn BatchSink,
    ) -> Result<QueryStats> {
        req.validate()?;

        let filters: Arc<[LineFilter]> = Arc::from(req.selector.filters.clone());
        let mut iters: Vec<Box<dyn EntryIterator>> = Vec::new();
        let mut chunks_matched = 0u64;
        self.for_matching_streams(&req.selector.matchers, |stream| {
            chunks_matched += stream.chunks_in_range(req.start, req.end) as u64;
            iters.push(Box::new(stream.iterator(
                req.start,
                req.end,
                req.direction,
                &filters,
            )));
            Ok(())
        })?;

        let mut merged = HeapIterator::new(iters, req.direction);
        let sent = send_batches(ctx, &mut merged, sink, req.limit, self.cfg.query_batch_size);
        let closed = merged.close();

        let mut stats = sent?;
        closed?;
        stats.total_chunks_matched = chunks_matched;
        debug!(
            tenant = %self.tenant,
            streams = merged.source_count(),
            chunks = stats.total_chunks_matched,
            lines = stats.total_lines_sent,
            batches = stats.total_batches,
            "query finished"
        );
        Ok(stats)
    }

    /// Calls `f` for every stream matching all `matchers`, under the shared
    /// lock.
    ///
    /// Index-resolvable matchers select candidates; the rest are checked
    /// against each candidate's labels. `f` must not keep the stream
    /// reference past the call.
    ///
    /// # Errors
    ///
    /// - [`QueryError::StreamMissing`] if the index returns a fingerprint the
    ///   stream map does not hold
    /// - Any error returned by `f`, which stops the iteration
    pub fn for_matching_streams<F>(&self, matchers: &[Matcher], mut f: F) -> Result<()>
    where
        F: FnMut(&Stream) -> Result<()>,
    {
        let state = self.state.read();
        let (filters, matchers) = split_filters_and_matchers(matchers);

        for fp in self.index.lookup(&matchers) {
            let stream = state
                .streams
                .get(&fp)
                .ok_or(QueryError::StreamMissing {
                    fingerprint: fp.value(),
                })?;
            if filters.iter().all(|m| m.matches_labels(stream.labels())) {
                f(stream)?;
            }
        }
        Ok(())
    }

    /// Returns label names, or the values of one label.
    ///
    /// Served from the index alone.
    pub fn label(&self, req: &LabelRequest) -> LabelResponse {
        let values = match (req.values, req.name.as_deref()) {
            (true, Some(name)) => self.index.label_values(name),
            (true, None) => Vec::new(),
            (false, _) => self.index.label_names(),
        };
        LabelResponse { values }
    }

    /// Returns the label sets of streams matching any group, each once,
    /// sorted by label set.
    ///
    /// # Errors
    ///
    /// Propagates [`Instance::for_matching_streams`] errors.
    pub fn series(&self, req: &SeriesRequest) -> Result<SeriesResponse> {
        let mut deduped: HashMap<Fingerprint, SeriesIdentifier> = HashMap::new();
        for group in &req.groups {
            self.for_matching_streams(group, |stream| {
                deduped
                    .entry(stream.fingerprint())
                    .or_insert_with(|| SeriesIdentifier {
                        labels: stream
                            .labels()
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    });
                Ok(())
            })?;
        }

        let mut series: Vec<SeriesIdentifier> = deduped.into_values().collect();
        series.sort();
        Ok(SeriesResponse { series })
    }

    /// Registers a new live tail for `selector`.
    ///
    /// Returns the tailer handle and the receiver its batches arrive on.
    pub fn tail(&self, selector: Selector) -> (Arc<Tailer>, mpsc::Receiver<StreamBatch>) {
        let (tailer, receiver) = Tailer::new(self.tailer_ids.next(), selector, self.cfg.tail_buffer);
        self.add_new_tailer(Arc::clone(&tailer));
        (tailer, receiver)
    }

    /// Wires `tailer` into every existing matching stream, then registers it.
    pub fn add_new_tailer(&self, tailer: Arc<Tailer>) {
        let state = self.state.read();
        let mut wired = 0usize;
        for stream in state.streams.values() {
            if stream.matches_tailer(&tailer) {
                stream.add_tailer(&tailer);
                wired += 1;
            }
        }
        let id = tailer.id();
        self.tailers.write().insert(id, tailer);
        drop(state);

        info!(tenant = %self.tenant, tailer = id, streams = wired, "registered tailer");
    }

    /// Wires every open, matching tailer into a freshly created stream.
    fn add_tailers_to_new_stream(&self, stream: &Stream) {
        let tailers = self.tailers.read();
        for tailer in tailers.values() {
            if stream.matches_tailer(tailer) {
                stream.add_tailer(tailer);
            }
        }
    }

    /// Closes the tailer with `id`. Returns `false` if it is not registered.
    ///
    /// The registry entry is removed by the next cleanup sweep.
    pub fn close_tailer(&self, id: u32) -> bool {
        match self.tailers.read().get(&id) {
            Some(tailer) => {
                tailer.close();
                true
            }
            None => false,
        }
    }

    /// Removes closed tailers from the registry.
    ///
    /// Closed tailers are found under the shared lock; the exclusive lock is
    /// only taken when there is something to remove.
    pub fn check_closed_tailers(&self) {
        let closed: Vec<u32> = self
            .tailers
            .read()
            .values()
            .filter(|t| t.is_closed())
            .map(|t| t.id())
            .collect();
        if closed.is_empty() {
            return;
        }

        let mut tailers = self.tailers.write();
        let mut removed = 0usize;
        for id in closed {
            if tailers.get(&id).is_some_and(|t| t.is_closed()) {
                tailers.remove(&id);
                removed += 1;
            }
        }
        info!(tenant = %self.tenant, removed, "removed closed tailers");
    }

    /// Closes and unregisters every tailer.
    pub fn close_tailers(&self) {
        let mut tailers = self.tailers.write();
        for tailer in tailers.values() {
            tailer.close();
        }
        let count = tailers.len();
        tailers.clear();
        if count > 0 {
            info!(tenant = %self.tenant, count, "closed all tailers");
        }
    }

    /// Sweeps closed tailers, then returns how many remain.
    pub fn open_tailers_count(&self) -> usize {
        self.check_closed_tailers();
        self.tailers.read().len()
    }

    /// Returns the number of streams held.
    pub fn stream_count(&self) -> usize {
        self.state.read().streams.len()
    }

    /// Returns a snapshot of the instance counters.
    pub fn metrics(&self) -> InstanceMetrics {
        InstanceMetrics {
            streams_created_total: self.streams_created_total.load(Ordering::Relaxed),
            memory_streams: self.memory_streams.load(Ordering::Relaxed),
            memory_chunks: self.memory_chunks.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("tenant", &self.tenant)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}
