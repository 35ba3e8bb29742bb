//! Instance configuration.
//!
//! Every field has a default, so a config file only needs to list what it
//! changes:
//!
//! ```json
//! {
//!   "block_size": 262144,
//!   "sync_period": 900.0,
//!   "sync_min_utilization": 0.2,
//!   "max_streams_per_user": 5000
//! }
//! ```
//!
//! Durations are written as (fractional) seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkFactory, MemChunk};
use crate::error::{ConfigError, Result};
use crate::query::QUERY_BATCH_SIZE;

/// Configuration of one tenant instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Head block size in bytes before a block is cut.
    pub block_size: usize,

    /// Number of cut blocks after which a chunk is full.
    pub blocks_per_chunk: usize,

    /// Period of synchronized chunk cuts across streams. Zero disables it.
    #[serde(with = "duration_serde")]
    pub sync_period: Duration,

    /// Minimum head utilization required for a synchronized cut.
    ///
    /// `0.0` cuts at every boundary regardless of utilization.
    pub sync_min_utilization: f64,

    /// Maximum number of streams per tenant. Zero means unlimited.
    pub max_streams_per_user: usize,

    /// Maximum number of per-entry messages in a rejected-push error.
    pub max_returned_stream_errors: usize,

    /// Maximum number of entries per query batch.
    pub query_batch_size: u32,

    /// Capacity of each tailer's channel, in batches.
    pub tail_buffer: usize,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            block_size: 256 * 1024,
            blocks_per_chunk: 10,
            sync_period: Duration::ZERO,
            sync_min_utilization: 0.0,
            max_streams_per_user: 10_000,
            max_returned_stream_errors: 10,
            query_batch_size: QUERY_BATCH_SIZE,
            tail_buffer: 10,
        }
    }
}

impl InstanceConfig {
    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Read`] if the file cannot be read
    /// - [`ConfigError::Parse`] if it is not valid config JSON
    /// - [`ConfigError::InvalidValue`] if a value fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(invalid("block_size", "cannot be zero"));
        }
        if self.blocks_per_chunk == 0 {
            return Err(invalid("blocks_per_chunk", "cannot be zero"));
        }
        if !(0.0..=1.0).contains(&self.sync_min_utilization) {
            return Err(invalid(
                "sync_min_utilization",
                format!("{} is outside [0, 1]", self.sync_min_utilization),
            ));
        }
        if self.query_batch_size == 0 {
            return Err(invalid("query_batch_size", "cannot be zero"));
        }
        if self.tail_buffer == 0 {
            return Err(invalid("tail_buffer", "cannot be zero"));
        }
        Ok(())
    }

    /// Returns a factory for the chunks this config describes.
    pub fn chunk_factory(&self) -> ChunkFactory {
        MemChunk::factory(self.block_size, self.blocks_per_chunk)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> crate::error::RivuletError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
    .into()
}

/// Serde helper storing a [`Duration`] as seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(D::Error::custom)
    }
}
