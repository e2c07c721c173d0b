use heed::{RoTxn, RwTxn};

use crate::env::{PlanBEnv, Table};
use crate::error::{hex, PlanBError, PlanBResult};

/// Largest payload a UID lookup accepts. Payloads are LMDB keys in the
/// forward table, and LMDB keys are limited to 511 bytes.
pub const MAX_UID_PAYLOAD: usize = 511;

const UID_BYTES: usize = 4;

/// Sequential-id interning table.
#[derive(Clone)]
pub struct UidLookupDb {
    name: String,
    forward: Table,
    reverse: Table,
    info: Table,
    next_key: Vec<u8>,
    empty_key: Vec<u8>,
}

impl UidLookupDb {
    /// Open (creating if writable) the forward and reverse tables for `name`.
    pub fn open(env: &PlanBEnv, name: &str) -> PlanBResult<Self> {
        Ok(Self {
            name: name.to_string(),
            forward: env.open_table(&format!("{}_forward", name))?,
            reverse: env.open_table(&format!("{}_reverse", name))?,
            info: env.info_table(),
            next_key: format!("uid_next:{}", name).into_bytes(),
            // LMDB rejects empty keys, so the empty payload's id lives in the info table.
            empty_key: format!("uid_empty:{}", name).into_bytes(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of every id.
    pub fn id_len(&self) -> usize {
        UID_BYTES
    }

    /// Intern `payload` and return its id.
    pub fn put(&self, txn: &mut RwTxn<'_>, payload: &[u8]) -> PlanBResult<Vec<u8>> {
        if payload.len() > MAX_UID_PAYLOAD {
            return Err(PlanBError::SizeExceeded {
                component: format!("uid lookup '{}' payload", self.name),
                size: payload.len(),
                max: MAX_UID_PAYLOAD,
            });
        }
        if let Some(id) = self.get(txn, payload)? {
            return Ok(id);
        }

        let uid = self.next_uid(txn)?;
        let id = uid.to_be_bytes();
        let next = uid.checked_add(1).ok_or_else(|| {
            PlanBError::InvariantViolation(format!("uid lookup '{}' has exhausted its ids", self.name))
        })?;

        self.reverse.put(txn, &id, payload)?;
        if payload.is_empty() {
            self.info.put(txn, &self.empty_key, &id)?;
        } else {
            self.forward.put(txn, payload, &id)?;
        }
        self.info.put(txn, &self.next_key, &next.to_be_bytes())?;
        Ok(id.to_vec())
    }

    /// Resolve the id of `payload` without allocating one.
    pub fn get(&self, txn: &RoTxn<'_>, payload: &[u8]) -> PlanBResult<Option<Vec<u8>>> {
        if payload.len() > MAX_UID_PAYLOAD {
            return Ok(None);
        }
        let found = if payload.is_empty() {
            self.info.get(txn, &self.empty_key)?
        } else {
            self.forward.get(txn, payload)?
        };
        Ok(found.map(<[u8]>::to_vec))
    }

    /// Payload stored under `id`.
    pub fn get_value<'t>(&self, txn: &'t RoTxn<'_>, id: &[u8]) -> PlanBResult<&'t [u8]> {
        self.reverse.get(txn, id)?.ok_or_else(|| PlanBError::MissingLookup {
            table: self.name.clone(),
            id: hex(id),
        })
    }

    pub fn ids(&self, txn: &RoTxn<'_>) -> PlanBResult<Vec<Vec<u8>>> {
        let mut ids = Vec::new();
        for entry in self.reverse.iter(txn)? {
            let (id, _) = entry?;
            ids.push(id.to_vec());
        }
        Ok(ids)
    }

    /// Remove both directions of `id`. Returns false if it did not exist.
    pub fn delete(&self, txn: &mut RwTxn<'_>, id: &[u8]) -> PlanBResult<bool> {
        let payload = match self.reverse.get(txn, id)? {
            Some(payload) => payload.to_vec(),
            None => return Ok(false),
        };
        if payload.is_empty() {
            self.info.delete(txn, &self.empty_key)?;
        } else {
            self.forward.delete(txn, &payload)?;
        }
        Ok(self.reverse.delete(txn, id)?)
    }

    pub fn len(&self, txn: &RoTxn<'_>) -> PlanBResult<u64> {
        Ok(self.reverse.len(txn)?)
    }

    /// The allocation counter only moves forward, so an id freed by garbage
    /// collection is never handed out again.
    fn next_uid(&self, txn: &RoTxn<'_>) -> PlanBResult<u32> {
        match self.info.get(txn, &self.next_key)? {
            None => Ok(0),
            Some(bytes) => <[u8; UID_BYTES]>::try_from(bytes)
                .map(u32::from_be_bytes)
                .map_err(|_| PlanBError::corrupt(
                    format!("uid lookup '{}' counter", self.name),
                    format!("{} bytes", bytes.len()),
                )),
        }
    }
}

impl std::fmt::Debug for UidLookupDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UidLookupDb").field("name", &self.name).finish()
    }
}
