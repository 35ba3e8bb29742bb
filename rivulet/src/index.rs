//! Inverted index from label name/value pairs to stream fingerprints.
//!
//! The index is split into [`INDEX_SHARDS`] shards by fingerprint, each
//! behind its own lock. Writers (stream creation) touch one shard; readers
//! (`lookup`, `label_names`, `label_values`) visit every shard and merge the
//! results. Because the index synchronizes itself, metadata requests can be
//! answered without the instance's stream-map lock.
//!
//! Posting lists are kept sorted so that intersections and unions across
//! matchers are linear merges.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;

use crate::labels::{Fingerprint, Labels};
use crate::matcher::{MatchType, Matcher};

/// Number of independently locked index shards.
pub const INDEX_SHARDS: usize = 16;

/// Label name -> label value -> sorted fingerprints.
type Postings = HashMap<String, HashMap<String, Vec<Fingerprint>>>;

/// Sharded inverted index over stream label sets.
#[derive(Debug)]
pub struct InvertedIndex {
    shards: Vec<RwLock<IndexShard>>,
}

#[derive(Debug, Default)]
struct IndexShard {
    postings: Postings,
}

impl InvertedIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            shards: (0..INDEX_SHARDS)
                .map(|_| RwLock::new(IndexShard::default()))
                .collect(),
        }
    }

    /// Registers `labels` under `fp` and returns the canonical label set.
    ///
    /// The returned set is sorted by name and becomes the stream's identity.
    pub fn add(&self, labels: &Labels, fp: Fingerprint) -> Labels {
        let mut shard = self.shard_for(fp).write();
        for (name, value) in labels.iter() {
            let fps = shard
                .postings
                .entry(name.to_string())
                .or_default()
                .entry(value.to_string())
                .or_default();
            if let Err(pos) = fps.binary_search(&fp) {
                fps.insert(pos, fp);
            }
        }
        labels.clone()
    }

    /// Returns the sorted fingerprints whose labels satisfy every matcher.
    ///
    /// Only pass index-resolvable matchers here (see
    /// [`crate::matcher::split_filters_and_matchers`]); a matcher that also
    /// accepts absent labels would miss streams that lack the label. With no
    /// matchers at all, every indexed fingerprint is returned.
    pub fn lookup(&self, matchers: &[Matcher]) -> Vec<Fingerprint> {
        let mut result = Vec::new();
        for shard in &self.shards {
            let found = shard.read().lookup(matchers);
            result = merge(&result, &found);
        }
        result
    }

    /// Returns every label name, sorted.
    pub fn label_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for shard in &self.shards {
            names.extend(shard.read().postings.keys().cloned());
        }
        names.into_iter().collect()
    }

    /// Returns every value seen for `name`, sorted.
    pub fn label_values(&self, name: &str) -> Vec<String> {
        let mut values = BTreeSet::new();
        for shard in &self.shards {
            if let Some(v) = shard.read().postings.get(name) {
                values.extend(v.keys().cloned());
            }
        }
        values.into_iter().collect()
    }

    fn shard_for(&self, fp: Fingerprint) -> &RwLock<IndexShard> {
        // The modulo keeps the value below INDEX_SHARDS.
        #[allow(clippy::cast_possible_truncation)]
        let shard = (fp.value() % INDEX_SHARDS as u64) as usize;
        &self.shards[shard]
    }
}

impl Default for InvertedIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexShard {
    fn lookup(&self, matchers: &[Matcher]) -> Vec<Fingerprint> {
        if matchers.is_empty() {
            return self.all();
        }

        let mut result: Option<Vec<Fingerprint>> = None;
        for matcher in matchers {
            let Some(values) = self.postings.get(matcher.name()) else {
                return Vec::new();
            };

            let found = if matcher.kind() == MatchType::Equal {
                values.get(matcher.value()).cloned().unwrap_or_default()
            } else {
                values
                    .iter()
                    .filter(|(value, _)| matcher.matches(value))
                    .fold(Vec::new(), |acc, (_, fps)| merge(&acc, fps))
            };

            let next = match result {
                None => found,
                Some(prev) => intersect(&prev, &found),
            };
            if next.is_empty() {
                return next;
            }
            result = Some(next);
        }
        result.unwrap_or_default()
    }

    fn all(&self) -> Vec<Fingerprint> {
        let mut all: Vec<Fingerprint> = self
            .postings
            .values()
            .flat_map(HashMap::values)
            .flatten()
            .copied()
            .collect();
        all.sort_unstable();
        all.dedup();
        all
    }
}

/// Union of two sorted, deduplicated lists.
fn merge(a: &[Fingerprint], b: &[Fingerprint]) -> Vec<Fingerprint> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Intersection of two sorted, deduplicated lists.
fn intersect(a: &[Fingerprint], b: &[Fingerprint]) -> Vec<Fingerprint> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
