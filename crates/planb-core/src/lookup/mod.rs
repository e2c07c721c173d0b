//! Interning lookup tables
//!
//! Large or frequently repeated payloads are stored once in a secondary
//! table and referenced from rows by a compact fixed-width id.
//!
//! # Strategies
//!
//! - **Hash lookup** ([`HashLookupDb`]): id = content hash followed by a
//!   two-byte clash sequence. Candidates under the same hash are compared
//!   byte for byte; a new content under an existing hash takes the next
//!   sequence and counts as a clash.
//! - **UID lookup** ([`UidLookupDb`]): id = sequentially allocated `u32`,
//!   with forward (content → id) and reverse (id → content) tables. The
//!   payload is an LMDB key, so it is limited to [`MAX_UID_PAYLOAD`] bytes.
//!
//! Ids are never handed to different content while a row references them.
//! Rows are only removed by [`UsedLookups::delete_unused`] at the end of a
//! retention sweep.

mod hash;
mod uid;
mod used;

use serde::{Deserialize, Serialize};

pub use hash::HashLookupDb;
pub(crate) use hash::{read_count, ClashLedger};
pub use uid::{UidLookupDb, MAX_UID_PAYLOAD};
pub use used::{UsedLookups, UsedLookupsRecorder};

use heed::{RoTxn, RwTxn};

use crate::error::PlanBResult;

/// Width of the content hash used by hash lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashLength {
    /// 4 byte CRC32C
    #[default]
    Integer,
    /// 8 byte XXH3-64
    Long,
}

impl HashLength {
    /// Number of hash bytes at the front of an id.
    pub fn bytes(self) -> usize {
        match self {
            HashLength::Integer => 4,
            HashLength::Long => 8,
        }
    }

    /// Hash `payload`, returning the big-endian hash bytes.
    pub fn hash(self, payload: &[u8]) -> Vec<u8> {
        match self {
            HashLength::Integer => crc32c::crc32c(payload).to_be_bytes().to_vec(),
            HashLength::Long => xxhash_rust::xxh3::xxh3_64(payload).to_be_bytes().to_vec(),
        }
    }
}

/// Either kind of lookup table, used where the strategy does not matter.
#[derive(Debug, Clone)]
pub enum LookupTable {
    Hash(HashLookupDb),
    Uid(UidLookupDb),
}

impl LookupTable {
    pub fn name(&self) -> &str {
        match self {
            LookupTable::Hash(db) => db.name(),
            LookupTable::Uid(db) => db.name(),
        }
    }

    /// Fixed width of every id handed out by this table.
    pub fn id_len(&self) -> usize {
        match self {
            LookupTable::Hash(db) => db.id_len(),
            LookupTable::Uid(db) => db.id_len(),
        }
    }

    /// Intern `payload`, returning its id.
    pub fn put(&self, txn: &mut RwTxn<'_>, payload: &[u8]) -> PlanBResult<Vec<u8>> {
        match self {
            LookupTable::Hash(db) => db.put(txn, payload),
            LookupTable::Uid(db) => db.put(txn, payload),
        }
    }

    /// Resolve the id of `payload` without allocating one.
    pub fn get(&self, txn: &RoTxn<'_>, payload: &[u8]) -> PlanBResult<Option<Vec<u8>>> {
        match self {
            LookupTable::Hash(db) => db.get(txn, payload),
            LookupTable::Uid(db) => db.get(txn, payload),
        }
    }

    /// Payload stored under `id`. Fails with `MissingLookup` if there is none.
    pub fn get_value<'t>(&self, txn: &'t RoTxn<'_>, id: &[u8]) -> PlanBResult<&'t [u8]> {
        match self {
            LookupTable::Hash(db) => db.get_value(txn, id),
            LookupTable::Uid(db) => db.get_value(txn, id),
        }
    }

    /// All ids currently stored.
    pub fn ids(&self, txn: &RoTxn<'_>) -> PlanBResult<Vec<Vec<u8>>> {
        match self {
            LookupTable::Hash(db) => db.ids(txn),
            LookupTable::Uid(db) => db.ids(txn),
        }
    }

    pub fn delete(&self, txn: &mut RwTxn<'_>, id: &[u8]) -> PlanBResult<bool> {
        match self {
            LookupTable::Hash(db) => db.delete(txn, id),
            LookupTable::Uid(db) => db.delete(txn, id),
        }
    }

    pub fn len(&self, txn: &RoTxn<'_>) -> PlanBResult<u64> {
        match self {
            LookupTable::Hash(db) => db.len(txn),
            LookupTable::Uid(db) => db.len(txn),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_widths() {
        assert_eq!(HashLength::Integer.hash(b"abc").len(), 4);
        assert_eq!(HashLength::Long.hash(b"abc").len(), 8);
        assert_eq!(HashLength::Long.hash(b"abc"), HashLength::Long.hash(b"abc"));
        assert_ne!(HashLength::Integer.hash(b"abc"), HashLength::Integer.hash(b"abd"));
    }

    #[test]
    fn test_hash_length_json() {
        let json = serde_json::to_string(&HashLength::Long).unwrap();
        assert_eq!(json, "\"LONG\"");
    }
}
