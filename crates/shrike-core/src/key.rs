use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, ordered store key.
///
/// Keys compare by byte order. Primary keys and encoded secondary-index
/// keys both live in this space, so the range-tracking machinery never
/// needs to know which kind of traversal it is serving.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoreKey(Vec<u8>);

impl StoreKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The smallest key.
    pub fn min() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The immediate successor of this key in byte order.
    ///
    /// Converts an inclusive position into the exclusive left bound of
    /// everything strictly greater.
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0);
        Self(bytes)
    }

    /// The first key strictly greater than every key with this prefix,
    /// or `None` if no such key exists (all bytes `0xff`).
    pub fn prefix_end(&self) -> Option<Self> {
        let mut bytes = self.0.clone();
        while let Some(last) = bytes.last_mut() {
            if *last < 0xff {
                *last += 1;
                return Some(Self(bytes));
            }
            bytes.pop();
        }
        None
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({:02x?})", self.0)
    }
}

impl From<&str> for StoreKey {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// The right bound of a key range.
///
/// Bounds are ordered with `Unbounded` greater than any key, so ranges
/// can key ordered maps.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum KeyBound {
    /// Exclusive bound at the given key.
    Open(StoreKey),
    /// No bound.
    Unbounded,
}

impl KeyBound {
    /// Whether `key` is below this bound.
    pub fn admits(&self, key: &StoreKey) -> bool {
        match self {
            KeyBound::Open(bound) => key < bound,
            KeyBound::Unbounded => true,
        }
    }
}

/// A `[left, right)` interval over the store key space.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: StoreKey,
    pub right: KeyBound,
}

impl KeyRange {
    pub fn new(left: StoreKey, right: KeyBound) -> Self {
        Self { left, right }
    }

    /// The whole key space.
    pub fn universe() -> Self {
        Self {
            left: StoreKey::min(),
            right: KeyBound::Unbounded,
        }
    }

    /// An empty range positioned at `at`.
    pub fn empty_at(at: StoreKey) -> Self {
        Self {
            right: KeyBound::Open(at.clone()),
            left: at,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            KeyBound::Open(right) => *right <= self.left,
            KeyBound::Unbounded => false,
        }
    }

    pub fn contains(&self, key: &StoreKey) -> bool {
        *key >= self.left && self.right.admits(key)
    }

    /// The right bound as a key, if one exists.
    ///
    /// `None` plays the role of "positive infinity" for descending
    /// traversals that resume from the right edge.
    pub fn right_key(&self) -> Option<&StoreKey> {
        match &self.right {
            KeyBound::Open(right) => Some(right),
            KeyBound::Unbounded => None,
        }
    }

    /// The intersection of two ranges.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let left = self.left.clone().max(other.left.clone());
        let right = match (&self.right, &other.right) {
            (KeyBound::Unbounded, r) | (r, KeyBound::Unbounded) => r.clone(),
            (KeyBound::Open(a), KeyBound::Open(b)) => KeyBound::Open(a.clone().min(b.clone())),
        };
        KeyRange { left, right }
    }
}

/// A `[beg, end)` interval over the hash-partition space.
///
/// Each hash-shard owns one of these; a key belongs to the shard whose
/// range contains the key's hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct HashRange {
    pub beg: u64,
    pub end: u64,
}

impl HashRange {
    pub fn new(beg: u64, end: u64) -> Self {
        Self { beg, end }
    }

    pub fn contains(&self, hash: u64) -> bool {
        hash >= self.beg && hash < self.end
    }
}

/// FNV-1a over the key bytes; decides hash-shard membership.
pub fn key_hash(key: &StoreKey) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
