//! Error types for the rivulet log stream store.

use std::fmt;

use thiserror::Error;

/// The main error type for all rivulet operations.
///
/// Each variant wraps the error enum of one area of the store. Transport
/// layers map errors to a response class with [`RivuletError::status_code`].
#[derive(Error, Debug)]
pub enum RivuletError {
    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// A label set could not be accepted.
    #[error("label error: {0}")]
    Label(#[from] LabelError),

    /// Error while routing entries into a stream.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Error raised by a chunk.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Error on the read path.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// The tenant hit an admission limit.
    #[error("limit error: {0}")]
    Limit(#[from] LimitError),

    /// More than one series of a push request failed.
    #[error("{0}")]
    Push(#[from] PushErrors),
}

impl RivuletError {
    /// Returns the HTTP-style status class a transport should report.
    ///
    /// - `400` for input the caller can fix (bad labels, rejected entries,
    ///   malformed matchers)
    /// - `429` for admission rejections
    /// - `500` for everything else, including index/store desynchronization
    ///
    /// For [`RivuletError::Push`] the status of the last failure is reported,
    /// so a batch surfaces the same class a single-series push would.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Label(_) => 400,
            Self::Limit(_) => 429,
            Self::Stream(StreamError::EntriesRejected { .. }) => 400,
            Self::Chunk(ChunkError::OutOfOrder { .. }) => 400,
            Self::Query(QueryError::InvalidRegex { .. })
            | Self::Query(QueryError::InvalidMatcher { .. })
            | Self::Query(QueryError::InvalidDirection { .. })
            | Self::Query(QueryError::InvalidTimeRange { .. }) => 400,
            Self::Push(errors) => errors.last().map_or(500, RivuletError::status_code),
            _ => 500,
        }
    }

    /// Returns `true` if this error belongs to the rate-limit class.
    pub fn is_rate_limited(&self) -> bool {
        self.status_code() == 429
    }
}

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration field has an unusable value.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::InstanceConfig`].
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that can occur when building a label set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    /// No labels remain after dropping empty values.
    #[error("label set is empty")]
    Empty,

    /// A label name is not of the form `[a-zA-Z_][a-zA-Z0-9_]*`.
    #[error("invalid label name '{name}'")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The same label name appears more than once.
    #[error("duplicate label name '{name}'")]
    DuplicateName {
        /// The repeated name.
        name: String,
    },
}

/// Errors that can occur while routing entries into a stream.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Some entries of a push were rejected by the stream.
    ///
    /// The remaining entries were stored and fanned out to tailers.
    #[error("{ignored} of {total} entries ignored for stream {stream}, last reason: '{last}'")]
    EntriesRejected {
        /// The stream's label set, rendered.
        stream: String,
        /// How many entries were rejected.
        ignored: usize,
        /// How many entries the push carried.
        total: usize,
        /// The last rejection reason.
        #[source]
        last: ChunkError,
        /// Per-entry messages, capped by `max_returned_stream_errors`.
        details: Vec<String>,
    },

    /// The reserved fingerprint space for collision mapping is used up.
    #[error("more than {max} fingerprints mapped in collision detection")]
    FingerprintsExhausted {
        /// The size of the reserved space.
        max: u64,
    },
}

/// Errors raised by chunks.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// The entry is older than the newest entry already stored.
    #[error("entry out of order: timestamp {timestamp} is before {newest}")]
    OutOfOrder {
        /// The rejected entry's timestamp.
        timestamp: u64,
        /// The newest timestamp already stored.
        newest: u64,
    },

    /// The chunk was closed and accepts no more entries.
    #[error("chunk is closed")]
    Closed,

    /// Serializing the chunk failed.
    #[error("failed to encode chunk: {source}")]
    Encode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Compressing or decompressing chunk bytes failed.
    #[error("chunk compression failed: {source}")]
    Compression {
        /// The underlying snappy error.
        #[source]
        source: snap::Error,
    },

    /// The chunk bytes could not be decoded.
    #[error("failed to decode chunk: {reason}")]
    Decode {
        /// What was wrong with the bytes.
        reason: String,
    },
}

/// Errors that can occur on the read path.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The index returned a fingerprint that has no stream.
    ///
    /// This means the index and the stream map went out of sync.
    #[error("stream missing for fingerprint {fingerprint:016x}")]
    StreamMissing {
        /// The dangling fingerprint.
        fingerprint: u64,
    },

    /// A regular expression in a matcher or line filter does not compile.
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        /// The pattern as given.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// A matcher string could not be parsed.
    #[error("invalid matcher '{input}': {reason}")]
    InvalidMatcher {
        /// The input as given.
        input: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A direction string is neither `forward` nor `backward`.
    #[error("invalid direction '{input}'")]
    InvalidDirection {
        /// The input as given.
        input: String,
    },

    /// The time range is inverted.
    #[error("invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// The start time.
        start: u64,
        /// The end time.
        end: u64,
    },

    /// The caller's sink refused a batch.
    #[error("failed to send batch: {source}")]
    Send {
        /// The sink's error.
        #[source]
        source: crate::query::SendError,
    },
}

/// Admission errors reported by a [`crate::limiter::Limiter`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LimitError {
    /// The tenant already owns the maximum number of streams.
    #[error(
        "maximum active stream limit exceeded for tenant '{tenant}': limit {limit}, current {current}"
    )]
    MaxStreamsPerUser {
        /// The tenant that hit the limit.
        tenant: String,
        /// The configured maximum.
        limit: usize,
        /// The tenant's current stream count.
        current: usize,
    },
}

/// Every per-series failure of one push request.
///
/// Only built when two or more series fail; a single failure is returned
/// as-is.
#[derive(Debug)]
pub struct PushErrors {
    /// The failures, in request order.
    pub errors: Vec<RivuletError>,
    /// How many series the request carried.
    pub total: usize,
}

impl PushErrors {
    /// Returns the last failure, which decides the reported status.
    pub fn last(&self) -> Option<&RivuletError> {
        self.errors.last()
    }

    /// Returns the number of failed series.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns `true` if no failures were recorded.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for PushErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} streams failed to push", self.errors.len(), self.total)?;
        if let Some(last) = self.last() {
            write!(f, ", last error: {last}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PushErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.last().map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Type alias for `Result<T, RivuletError>`.
pub type Result<T> = std::result::Result<T, RivuletError>;
