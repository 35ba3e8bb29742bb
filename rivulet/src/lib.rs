//! # rivulet
//!
//! In-memory, per-tenant log stream store.
//!
//! rivulet holds the recent log streams of one tenant in memory. A stream is
//! identified by its label set. The store accepts pushes of
//! `(labels, entries)` batches, answers time-range queries merged across
//! streams, serves label and series metadata from an inverted index, and
//! fans new entries out to live tail subscriptions.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Collision-free stream identity: raw label hashes go through a
//!   fingerprint mapper before keying the stream map
//! - Lazy k-way merge on the read path, bounded by the number of streams
//! - Query results are sent in pages without holding any store lock
//! - Tail delivery never blocks a push; slow subscribers lose batches
//!
//! ## Quick Start
//!
//! ```rust
//! use rivulet::{Entry, Instance, InstanceConfig, Matcher, PushRequest, PushStream};
//! use rivulet::query::{QueryContext, QueryRequest, QueryResponse};
//! use rivulet::matcher::Selector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let instance = Instance::from_config(InstanceConfig::default(), "tenant-a");
//!
//! // Push two streams
//! instance.push(&PushRequest {
//!     streams: vec![
//!         PushStream::new(&[("job", "api")], vec![Entry::new(1, "GET /"), Entry::new(3, "GET /a")]),
//!         PushStream::new(&[("job", "web")], vec![Entry::new(2, "render")]),
//!     ],
//! })?;
//!
//! // Query them back, merged by timestamp
//! let req = QueryRequest::new(Selector::new(vec![Matcher::new(
//!     rivulet::matcher::MatchType::Regex,
//!     "job",
//!     "api|web",
//! )?]), 0, 10);
//! let mut batches: Vec<QueryResponse> = Vec::new();
//! let stats = instance.query(&QueryContext::new(), &req, &mut batches)?;
//! assert_eq!(stats.total_lines_sent, 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Instance`]: top-level handle; owns streams, index and tailers
//! - [`InstanceConfig`]: chunking, synchronization and query settings
//! - [`Labels`] and [`Fingerprint`]: stream identity
//! - [`Matcher`] and [`matcher::Selector`]: stream and line selection
//!
//! ## Modules
//!
//! - [`instance`]: push, query, label, series and tail registry
//! - [`stream`]: one stream's chunks and tailers
//! - [`chunk`]: entries, the chunk trait and the in-memory chunk
//! - [`iter`]: per-chunk, per-stream and merged iterators
//! - [`query`]: request/response types and the batch sender
//! - [`index`]: sharded inverted index
//! - [`mapper`]: fingerprint collision mapping
//! - [`labels`]: label sets and fingerprints
//! - [`matcher`]: label matchers and line filters
//! - [`tailer`]: live tail subscriptions
//! - [`limiter`]: per-tenant admission limits
//! - [`config`]: instance configuration
//! - [`error`]: error types

pub mod chunk;
pub mod config;
pub mod error;
pub mod index;
pub mod instance;
pub mod iter;
pub mod labels;
pub mod limiter;
pub mod mapper;
pub mod matcher;
pub mod query;
pub mod stream;
pub mod tailer;

// Re-export primary API types at crate root for convenience.
pub use chunk::{Chunk, ChunkFactory, Entry, MemChunk};
pub use config::InstanceConfig;
pub use error::{Result, RivuletError};
pub use instance::{Instance, InstanceMetrics, PushRequest, PushStream};
pub use iter::Direction;
pub use labels::{Fingerprint, Labels};
pub use limiter::{Limiter, StaticLimiter};
pub use matcher::Matcher;
pub use tailer::Tailer;
