use hashbrown::HashSet;
use tracing::debug;

use super::LookupTable;
use crate::codec::ValCodec;
use crate::error::PlanBResult;
use crate::writer::Writer;

/// Collects the ids of one lookup table that surviving rows still reference.
#[derive(Debug)]
pub struct UsedLookupsRecorder {
    table: LookupTable,
    used: HashSet<Vec<u8>>,
}

impl UsedLookupsRecorder {
    pub fn new(table: LookupTable) -> Self {
        Self { table, used: HashSet::new() }
    }

    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    /// Record that `id` is still referenced.
    pub fn record_used(&mut self, id: &[u8]) {
        if !self.used.contains(id) {
            self.used.insert(id.to_vec());
        }
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    /// Delete every lookup row whose id was not recorded. Must only run once
    /// all row deletion for the sweep is complete.
    pub fn delete_unused(&mut self, writer: &mut Writer<'_>) -> PlanBResult<u64> {
        let txn = writer.txn()?;
        let unused: Vec<Vec<u8>> = self
            .table
            .ids(txn)?
            .into_iter()
            .filter(|id| !self.used.contains(id.as_slice()))
            .collect();

        let mut deleted = 0u64;
        for id in &unused {
            if self.table.delete(txn, id)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            writer.increment_change_count();
        }
        debug!(table = %self.table.name(), deleted, kept = self.used.len(), "Deleted unused lookups");
        self.used.clear();
        Ok(deleted)
    }
}

/// Recorders for a shard's key and value codecs, either of which may not
/// use a lookup at all.
#[derive(Debug, Default)]
pub struct UsedLookups {
    pub key: Option<UsedLookupsRecorder>,
    pub value: Option<UsedLookupsRecorder>,
}

impl UsedLookups {
    pub fn for_codecs(key: &ValCodec, value: Option<&ValCodec>) -> Self {
        Self {
            key: key.used_lookups_recorder(),
            value: value.and_then(ValCodec::used_lookups_recorder),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.value.is_none()
    }

    pub fn record_key(&mut self, id: &[u8]) {
        if let Some(recorder) = self.key.as_mut() {
            recorder.record_used(id);
        }
    }

    pub fn record_value(&mut self, id: &[u8]) {
        if let Some(recorder) = self.value.as_mut() {
            recorder.record_used(id);
        }
    }

    pub fn delete_unused(&mut self, writer: &mut Writer<'_>) -> PlanBResult<u64> {
        let mut deleted = 0;
        for recorder in [self.key.as_mut(), self.value.as_mut()].into_iter().flatten() {
            deleted += recorder.delete_unused(writer)?;
        }
        Ok(deleted)
    }
}
