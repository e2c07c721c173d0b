use std::sync::Arc;

use hashbrown::HashMap;
use heed::{RoTxn, RwTxn};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::HashLength;
use crate::env::{PlanBEnv, Table};
use crate::error::{hex, PlanBError, PlanBResult};

/// Bytes of clash sequence appended to the hash in every id.
const SEQUENCE_BYTES: usize = 2;

/// Info table key holding the running hash clash total.
pub(crate) const HASH_CLASH_COUNT_KEY: &[u8] = b"hash_clash_count";

/// Content-hash interning table.
#[derive(Clone)]
pub struct HashLookupDb {
    name: String,
    table: Table,
    hash_length: HashLength,
    ledger: Arc<ClashLedger>,
}

impl HashLookupDb {
    /// Open (creating if writable) the lookup table `name` in `env`.
    pub fn open(env: &PlanBEnv, name: &str, hash_length: HashLength) -> PlanBResult<Self> {
        Ok(Self {
            name: name.to_string(),
            table: env.open_table(name)?,
            hash_length,
            ledger: env.clash_ledger(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hash_length(&self) -> HashLength {
        self.hash_length
    }

    /// Width of every id: hash bytes plus the clash sequence.
    pub fn id_len(&self) -> usize {
        self.hash_length.bytes() + SEQUENCE_BYTES
    }

    /// Intern `payload` and return its id.
    pub fn put(&self, txn: &mut RwTxn<'_>, payload: &[u8]) -> PlanBResult<Vec<u8>> {
        let mut id = self.hash_length.hash(payload);
        let (existing, sequence) = self.probe(txn, &id, payload)?;
        if let Some(id) = existing {
            return Ok(id);
        }

        id.extend_from_slice(&sequence.to_be_bytes());
        self.table.put(txn, &id, payload)?;

        let clash = sequence > 0;
        if clash {
            warn!(table = %self.name, id = %hex(&id), "Hash clash on lookup insert");
        }
        self.ledger.record(NewLookupId {
            name: self.name.clone(),
            table: self.table,
            hash_len: self.hash_length.bytes(),
            id: id.clone(),
            clash,
        });
        Ok(id)
    }

    /// Resolve the id of `payload` without inserting it.
    pub fn get(&self, txn: &RoTxn<'_>, payload: &[u8]) -> PlanBResult<Option<Vec<u8>>> {
        let hash = self.hash_length.hash(payload);
        Ok(self.probe(txn, &hash, payload)?.0)
    }

    /// Payload stored under `id`.
    pub fn get_value<'t>(&self, txn: &'t RoTxn<'_>, id: &[u8]) -> PlanBResult<&'t [u8]> {
        self.table.get(txn, id)?.ok_or_else(|| PlanBError::MissingLookup {
            table: self.name.clone(),
            id: hex(id),
        })
    }

    pub fn ids(&self, txn: &RoTxn<'_>) -> PlanBResult<Vec<Vec<u8>>> {
        let mut ids = Vec::new();
        for entry in self.table.iter(txn)? {
            let (id, _) = entry?;
            ids.push(id.to_vec());
        }
        Ok(ids)
    }

    pub fn delete(&self, txn: &mut RwTxn<'_>, id: &[u8]) -> PlanBResult<bool> {
        Ok(self.table.delete(txn, id)?)
    }

    pub fn len(&self, txn: &RoTxn<'_>) -> PlanBResult<u64> {
        Ok(self.table.len(txn)?)
    }

    /// Scan the candidates under `hash`. Returns the id of a byte-equal
    /// payload if present, and otherwise the sequence a new entry would take.
    fn probe(&self, txn: &RoTxn<'_>, hash: &[u8], payload: &[u8]) -> PlanBResult<(Option<Vec<u8>>, u16)> {
        let mut next: u32 = 0;
        for entry in self.table.prefix_iter(txn, hash)? {
            let (id, stored) = entry?;
            if stored == payload {
                return Ok((Some(id.to_vec()), 0));
            }
            let seq = id
                .get(hash.len()..)
                .and_then(|s| <[u8; SEQUENCE_BYTES]>::try_from(s).ok())
                .map(u16::from_be_bytes)
                .ok_or_else(|| PlanBError::corrupt(
                    format!("hash lookup '{}'", self.name),
                    format!("id {} has no clash sequence", hex(id)),
                ))?;
            next = next.max(u32::from(seq) + 1);
        }
        let next = u16::try_from(next).map_err(|_| {
            PlanBError::InvariantViolation(format!(
                "hash {} in '{}' has exhausted its clash sequences",
                hex(hash),
                self.name
            ))
        })?;
        Ok((None, next))
    }
}

impl std::fmt::Debug for HashLookupDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashLookupDb")
            .field("name", &self.name)
            .field("hash_length", &self.hash_length)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Clash ledger
// ---------------------------------------------------------------------------

struct NewLookupId {
    name: String,
    table: Table,
    hash_len: usize,
    id: Vec<u8>,
    clash: bool,
}

/// Hash lookup ids allocated by the open write transaction.
///
/// The writer calls [`ClashLedger::resolve`] immediately before every
/// commit and [`ClashLedger::discard`] on abort, so the ledger always
/// describes exactly one transaction.
#[derive(Default)]
pub(crate) struct ClashLedger {
    pending: Mutex<Vec<NewLookupId>>,
}

impl ClashLedger {
    fn record(&self, entry: NewLookupId) {
        self.pending.lock().push(entry);
    }

    /// Verify that no two ids allocated in this transaction hold the same
    /// content, then add this transaction's clashes to the persisted total.
    /// Returns the number of clashes added.
    pub(crate) fn resolve(&self, txn: &mut RwTxn<'_>, info: Table) -> PlanBResult<u64> {
        let pending = std::mem::take(&mut *self.pending.lock());
        if pending.is_empty() {
            return Ok(0);
        }

        let mut by_hash: HashMap<(&str, &[u8]), Vec<&NewLookupId>> = HashMap::new();
        for entry in &pending {
            by_hash
                .entry((entry.name.as_str(), &entry.id[..entry.hash_len]))
                .or_default()
                .push(entry);
        }

        for ((name, _), entries) in by_hash.iter().filter(|(_, e)| e.len() > 1) {
            for (i, a) in entries.iter().enumerate() {
                let Some(payload_a) = a.table.get(txn, &a.id)? else { continue };
                for b in &entries[i + 1..] {
                    if b.table.get(txn, &b.id)? == Some(payload_a) {
                        return Err(PlanBError::InvariantViolation(format!(
                            "ids {} and {} in '{}' hold identical content",
                            hex(&a.id),
                            hex(&b.id),
                            name
                        )));
                    }
                }
            }
        }

        let clashes = pending.iter().filter(|e| e.clash).count() as u64;
        if clashes > 0 {
            let total = read_count(txn, info)? + clashes;
            info.put(txn, HASH_CLASH_COUNT_KEY, &total.to_be_bytes())?;
            debug!(clashes, total, "Recorded hash clashes");
        }
        Ok(clashes)
    }

    pub(crate) fn discard(&self) {
        self.pending.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Persisted hash clash total.
pub(crate) fn read_count(txn: &RoTxn<'_>, info: Table) -> PlanBResult<u64> {
    match info.get(txn, HASH_CLASH_COUNT_KEY)? {
        None => Ok(0),
        Some(bytes) => <[u8; 8]>::try_from(bytes)
            .map(u64::from_be_bytes)
            .map_err(|_| PlanBError::corrupt("hash clash count", format!("{} bytes", bytes.len()))),
    }
}
