//! Fingerprint collision resolution.
//!
//! Raw fingerprints come from [`crate::labels::fast_fingerprint`] and can
//! collide. The [`FingerprintMapper`] hands out a *mapped* fingerprint that
//! is unique among the label sets an instance holds.
//!
//! # Locking
//!
//! The mapper needs to read the labels of existing streams, and it is only
//! ever called by the instance while the stream map's write lock is held.
//! Instead of taking a lock of its own, [`FingerprintMapper::map_fp`] takes a
//! [`LabelsLookup`] borrowed from the caller's critical section. The mapper's
//! own state lives inside that same section, so it needs no synchronization.
//!
//! The accessor cannot be stored at construction. The stream map it reads is
//! only reachable through the guard of the lock that also owns the mapper, and
//! that borrow ends when the guard drops. A stored accessor would have to take
//! the lock itself, which deadlocks against the write lock the caller holds.
//!
//! # Reserved space
//!
//! Fingerprints `1..=MAX_MAPPED_FP` are reserved for mappings. A raw
//! fingerprint that falls into that range is always mapped, so a mapped value
//! can never shadow a real raw fingerprint.

use std::collections::HashMap;

use tracing::debug;

use crate::error::StreamError;
use crate::labels::{Fingerprint, Labels};

/// Upper bound of the reserved mapped fingerprint space (about one million).
pub const MAX_MAPPED_FP: u64 = 1 << 20;

/// Read access to the label set stored under a fingerprint.
///
/// Implemented by the instance's stream map. The mapper never holds on to
/// the accessor beyond one [`FingerprintMapper::map_fp`] call.
pub trait LabelsLookup {
    /// Returns the labels of the live series stored at `fp`, if any.
    fn labels_for(&self, fp: Fingerprint) -> Option<&Labels>;
}

impl LabelsLookup for HashMap<Fingerprint, Labels> {
    fn labels_for(&self, fp: Fingerprint) -> Option<&Labels> {
        self.get(&fp)
    }
}

/// Maps raw fingerprints to collision-free fingerprints.
///
/// The mapping is stable for the lifetime of the mapper: a label set always
/// yields the same mapped fingerprint, and two different label sets never
/// share one while both are live. Mappings are not portable across restarts.
#[derive(Debug, Default)]
pub struct FingerprintMapper {
    /// Highest mapped fingerprint handed out so far.
    highest_mapped: u64,
    /// raw fingerprint -> label set -> mapped fingerprint.
    mappings: HashMap<Fingerprint, HashMap<Labels, Fingerprint>>,
}

impl FingerprintMapper {
    /// Creates an empty mapper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `fp`, the raw fingerprint of `labels`, to its mapped value.
    ///
    /// 1. A raw value in the reserved range is always mapped.
    /// 2. If `lookup` has a live series at `fp` with the same labels, `fp`
    ///    is returned unchanged. With different labels it is a collision and
    ///    a mapping is reused or created.
    /// 3. If nothing lives at `fp`, a mapping recorded earlier for this
    ///    label set is returned, else `fp` itself.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::FingerprintsExhausted`] once more than
    /// [`MAX_MAPPED_FP`] collisions have been mapped.
    pub fn map_fp<L>(
        &mut self,
        fp: Fingerprint,
        labels: &Labels,
        lookup: &L,
    ) -> Result<Fingerprint, StreamError>
    where
        L: LabelsLookup + ?Sized,
    {
        if fp.value() <= MAX_MAPPED_FP {
            return self.maybe_add_mapping(fp, labels);
        }

        if let Some(existing) = lookup.labels_for(fp) {
            if existing == labels {
                return Ok(fp);
            }
            return self.maybe_add_mapping(fp, labels);
        }

        // Nothing lives at fp, but this label set may have been mapped away
        // from it while a colliding series was present.
        if let Some(mapped) = self.mappings.get(&fp).and_then(|m| m.get(labels)) {
            return Ok(*mapped);
        }

        Ok(fp)
    }

    /// Returns the number of label sets that have been mapped away from
    /// their raw fingerprint.
    pub fn mapped_count(&self) -> usize {
        self.mappings.values().map(HashMap::len).sum()
    }

    fn maybe_add_mapping(
        &mut self,
        fp: Fingerprint,
        labels: &Labels,
    ) -> Result<Fingerprint, StreamError> {
        if let Some(mapped) = self.mappings.get(&fp).and_then(|m| m.get(labels)) {
            return Ok(*mapped);
        }

        let mapped = self.next_mapped_fp()?;
        self.mappings
            .entry(fp)
            .or_default()
            .insert(labels.clone(), mapped);

        debug!(
            raw = %fp,
            mapped = %mapped,
            labels = %labels,
            "fingerprint collision detected, mapping to new fingerprint"
        );
        Ok(mapped)
    }

    fn next_mapped_fp(&mut self) -> Result<Fingerprint, StreamError> {
        if self.highest_mapped >= MAX_MAPPED_FP {
            return Err(StreamError::FingerprintsExhausted { max: MAX_MAPPED_FP });
        }
        self.highest_mapped += 1;
        Ok(Fingerprint(self.highest_mapped))
    }
}
