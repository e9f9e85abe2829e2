use serde::{Deserialize, Serialize};

use crate::{Datum, DatumRef, StoreKey};

/// One result row of a range read.
///
/// Rows are moved between per-shard buffers and the unsharded output;
/// only the datum itself is shared.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct RgetItem {
    /// The primary key of the row.
    pub key: StoreKey,
    /// The secondary-index value the row was found under, when the read
    /// traverses a secondary index.
    pub sindex_key: Option<DatumRef>,
    /// The row itself.
    pub datum: DatumRef,
}

impl RgetItem {
    pub fn new(key: StoreKey, datum: DatumRef) -> Self {
        Self {
            key,
            sindex_key: None,
            datum,
        }
    }

    pub fn with_sindex_key(key: StoreKey, sindex_key: DatumRef, datum: DatumRef) -> Self {
        Self {
            key,
            sindex_key: Some(sindex_key),
            datum,
        }
    }

    /// The key this row merges and resumes under.
    ///
    /// Secondary-index traversals order rows by the encoded index value
    /// with the primary key appended to break ties between duplicate
    /// index entries; primary traversals order by the primary key itself.
    pub fn merge_key(&self) -> StoreKey {
        match &self.sindex_key {
            Some(sindex) => sindex_item_key(sindex, &self.key),
            None => self.key.clone(),
        }
    }

    pub fn serialized_size(&self) -> usize {
        self.key.as_bytes().len() + self.datum.serialized_size()
    }
}

/// The store key a row occupies within a secondary index.
pub fn sindex_item_key(sindex: &Datum, primary: &StoreKey) -> StoreKey {
    let mut bytes = sindex.to_sindex_key().into_bytes();
    bytes.extend_from_slice(primary.as_bytes());
    StoreKey::new(bytes)
}
