use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::StoreKey;

/// A shared, immutable datum.
///
/// Datums are conceptually immutable once constructed, so they are shared
/// by reference count rather than cloned through the pipeline.
pub type DatumRef = Arc<Datum>;

/// An ordered JSON-like value.
///
/// Datums carry a total order so that they can be used directly as
/// secondary-index keys: the variant rank orders unlike types
/// (null < bool < number < string < array < object) and values of the same
/// type compare structurally. Numbers compare by IEEE total order, which
/// matches numeric order for every value the pipeline produces (NaN is
/// rejected at construction).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<DatumRef>),
    Object(BTreeMap<String, DatumRef>),
}

impl Datum {
    pub fn null() -> DatumRef {
        Arc::new(Datum::Null)
    }

    pub fn bool(b: bool) -> DatumRef {
        Arc::new(Datum::Bool(b))
    }

    /// Construct a number datum.
    ///
    /// Panics on NaN: non-total values would break the index key order.
    pub fn number(n: f64) -> DatumRef {
        assert!(!n.is_nan(), "NaN is not a valid datum");
        Arc::new(Datum::Number(n))
    }

    pub fn string(s: impl Into<String>) -> DatumRef {
        Arc::new(Datum::String(s.into()))
    }

    pub fn array(items: impl IntoIterator<Item = DatumRef>) -> DatumRef {
        Arc::new(Datum::Array(items.into_iter().collect()))
    }

    pub fn object(fields: impl IntoIterator<Item = (String, DatumRef)>) -> DatumRef {
        Arc::new(Datum::Object(fields.into_iter().collect()))
    }

    /// Look up a field on an object datum.
    pub fn get_field(&self, name: &str) -> Option<&DatumRef> {
        match self {
            Datum::Object(fields) => fields.get(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Number(_) => 2,
            Datum::String(_) => 3,
            Datum::Array(_) => 4,
            Datum::Object(_) => 5,
        }
    }

    /// An estimate of the serialized byte size of this datum.
    ///
    /// Used by the batch pacer's byte accounting; it only needs to be
    /// proportional to the real wire size, not exact.
    pub fn serialized_size(&self) -> usize {
        match self {
            Datum::Null => 4,
            Datum::Bool(_) => 5,
            Datum::Number(_) => 8,
            Datum::String(s) => s.len() + 2,
            Datum::Array(items) => {
                items.iter().map(|d| d.serialized_size()).sum::<usize>() + 2
            }
            Datum::Object(fields) => {
                fields
                    .iter()
                    .map(|(k, v)| k.len() + 3 + v.serialized_size())
                    .sum::<usize>()
                    + 2
            }
        }
    }

    /// Encode this datum as an order-preserving store key.
    ///
    /// For any two datums `a`, `b`: `a < b` iff
    /// `a.to_sindex_key() < b.to_sindex_key()` under byte order. This is
    /// what lets secondary-index traversal reuse the primary-key range
    /// machinery unchanged.
    pub fn to_sindex_key(&self) -> StoreKey {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        StoreKey::new(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.rank() + 1);
        match self {
            Datum::Null => {}
            Datum::Bool(b) => out.push(u8::from(*b)),
            Datum::Number(n) => {
                // Flip the sign bit (and all bits for negatives) so the
                // big-endian byte order matches numeric order.
                let bits = n.to_bits();
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits | (1 << 63)
                };
                out.extend_from_slice(&ordered.to_be_bytes());
            }
            Datum::String(s) => {
                // NUL-terminated so that a prefix sorts before an extension.
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            Datum::Array(items) => {
                for item in items {
                    item.encode_into(out);
                }
                out.push(0);
            }
            Datum::Object(fields) => {
                for (k, v) in fields {
                    out.extend_from_slice(k.as_bytes());
                    out.push(0);
                    v.encode_into(out);
                }
                out.push(0);
            }
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Number(a), Datum::Number(b)) => a.total_cmp(b),
            (Datum::String(a), Datum::String(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => a.iter().cmp(b.iter()),
            (Datum::Object(a), Datum::Object(b)) => a.iter().cmp(b.iter()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_rank_order() {
        let values = [
            Datum::Null,
            Datum::Bool(true),
            Datum::Number(1.0),
            Datum::String("a".to_owned()),
            Datum::Array(vec![]),
            Datum::Object(BTreeMap::new()),
        ];
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1], "{:?} < {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_string_prefix_orders_first() {
        assert!(Datum::String("ab".to_owned()) < Datum::String("abc".to_owned()));
        assert!(
            Datum::String("ab".to_owned()).to_sindex_key()
                < Datum::String("abc".to_owned()).to_sindex_key()
        );
    }

    proptest::proptest! {
        #[test]
        fn test_number_key_order_matches_numeric_order(a in -1e12f64..1e12, b in -1e12f64..1e12) {
            let (ka, kb) = (Datum::Number(a).to_sindex_key(), Datum::Number(b).to_sindex_key());
            prop_assert_eq!(a.total_cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn test_sindex_key_preserves_datum_order(a in -1000i64..1000, b in -1000i64..1000) {
            let (da, db) = (Datum::Number(a as f64), Datum::Number(b as f64));
            prop_assert_eq!(da.cmp(&db), da.to_sindex_key().cmp(&db.to_sindex_key()));
        }
    }
}
