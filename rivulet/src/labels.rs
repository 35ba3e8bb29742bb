//! Label sets and fingerprints.
//!
//! A stream is identified by its label set. Label sets are stored sorted by
//! name with unique names, so two pushes that list the same labels in a
//! different order land in the same stream.
//!
//! The raw identity of a label set is its [`Fingerprint`], computed by
//! [`fast_fingerprint`]. Raw fingerprints may collide; the
//! [`crate::mapper::FingerprintMapper`] resolves collisions into mapped
//! fingerprints that are unique within an instance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LabelError;

/// FNV-1a 64-bit offset basis.
const OFFSET_64: u64 = 14_695_981_039_346_656_037;

/// FNV-1a 64-bit prime.
const PRIME_64: u64 = 1_099_511_628_211;

/// Byte written between a label's name and value while hashing.
///
/// `0xff` never occurs in valid UTF-8, so `a=bc` and `ab=c` hash differently.
const SEPARATOR: u8 = 0xff;

/// 64-bit identity of a label set.
///
/// A raw fingerprint comes straight from [`fast_fingerprint`]. A mapped
/// fingerprint is what the instance keys its streams by; it equals the raw
/// value except when two live label sets collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Returns the numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Fingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A single name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    /// The label name.
    pub name: String,
    /// The label value.
    pub value: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An immutable label set, sorted by name with unique names.
///
/// # Examples
///
/// ```rust
/// use rivulet::labels::Labels;
///
/// let labels = Labels::from_pairs(&[
///     ("job".to_string(), "api".to_string()),
///     ("env".to_string(), "prod".to_string()),
/// ])?;
///
/// assert_eq!(labels.to_string(), r#"{env="prod", job="api"}"#);
/// assert_eq!(labels.get("job"), "api");
/// assert_eq!(labels.get("missing"), "");
/// # Ok::<(), rivulet::error::LabelError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Builds a label set from `(name, value)` pairs.
    ///
    /// Pairs with an empty value are dropped, since an empty value is
    /// indistinguishable from an absent label. The remaining pairs are sorted
    /// by name.
    ///
    /// # Errors
    ///
    /// - [`LabelError::Empty`] if no labels remain
    /// - [`LabelError::InvalidName`] if a name is not `[a-zA-Z_][a-zA-Z0-9_]*`
    /// - [`LabelError::DuplicateName`] if a name appears twice
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, LabelError> {
        let mut labels: Vec<Label> = Vec::with_capacity(pairs.len());
        for (name, value) in pairs {
            if !is_valid_label_name(name) {
                return Err(LabelError::InvalidName { name: name.clone() });
            }
            if value.is_empty() {
                continue;
            }
            labels.push(Label::new(name.as_str(), value.as_str()));
        }

        if labels.is_empty() {
            return Err(LabelError::Empty);
        }

        labels.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(pair) = labels.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(LabelError::DuplicateName {
                name: pair[0].name.clone(),
            });
        }

        Ok(Self(labels))
    }

    /// Returns the value of `name`, or `""` if the label is absent.
    pub fn get(&self, name: &str) -> &str {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .map(|i| self.0[i].value.as_str())
            .unwrap_or("")
    }

    /// Returns the labels in name order.
    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }

    /// Returns an iterator over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|l| (l.name.as_str(), l.value.as_str()))
    }

    /// Returns the number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set holds no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        f.write_str("}")
    }
}

/// Computes the raw fingerprint of a label set.
///
/// Each label is hashed on its own (`name 0xff value`) and the per-label
/// hashes are XORed together, so the result does not depend on label order.
/// This is fast but collision-prone; callers that need a unique identity
/// must go through the fingerprint mapper.
pub fn fast_fingerprint(labels: &Labels) -> Fingerprint {
    if labels.is_empty() {
        return Fingerprint(OFFSET_64);
    }

    let mut result = 0u64;
    for label in labels.as_slice() {
        let mut hash = OFFSET_64;
        hash = hash_add(hash, &label.name);
        hash = hash_add_byte(hash, SEPARATOR);
        hash = hash_add(hash, &label.value);
        result ^= hash;
    }
    Fingerprint(result)
}

fn hash_add(mut hash: u64, s: &str) -> u64 {
    for byte in s.bytes() {
        hash = hash_add_byte(hash, byte);
    }
    hash
}

fn hash_add_byte(hash: u64, byte: u8) -> u64 {
    (hash ^ u64::from(byte)).wrapping_mul(PRIME_64)
}

fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
