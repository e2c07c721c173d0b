//! Generic shard machinery
//!
//! A shard is one environment holding one row table plus whatever lookup
//! tables its codecs need. Concrete shards implement [`Db`]; this module
//! provides the pieces they share:
//!
//! - [`SchemaInfo`]: the persisted {version, key schema, value schema}
//!   descriptor, checked on open and before a merge.
//! - [`merge_and_delete`]: open a source shard read-only, fold it into the
//!   destination in one write transaction, then remove the source.
//! - [`delete_old_rows`]: the retention sweep with used-lookup tracking.
//! - [`Interrupt`]: cooperative cancellation for long sweeps.

use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use heed::RoTxn;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::coordinator::CommitHandle;
use crate::env::{PlanBEnv, Table};
use crate::error::{PlanBError, PlanBResult};
use crate::lookup::UsedLookups;
use crate::platform_durability;
use crate::search::{ExpressionCriteria, FieldIndex};
use crate::value::Val;
use crate::writer::Writer;

/// Version of the row layout written by this crate.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_KEY: &[u8] = b"schema";

/// Rows read per batch by the retention sweep.
const RETENTION_BATCH: usize = 1024;

// ---------------------------------------------------------------------------
// Schema descriptor
// ---------------------------------------------------------------------------

/// Persisted description of how a shard encodes its rows. Two shards can
/// only be merged when their descriptors are identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub schema_version: u32,
    pub key_schema: String,
    pub value_schema: String,
}

impl SchemaInfo {
    /// Descriptor for the current version from serializable key and value settings.
    pub fn new<K: Serialize, V: Serialize>(key: &K, value: &V) -> PlanBResult<Self> {
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            key_schema: serde_json::to_string(key)?,
            value_schema: serde_json::to_string(value)?,
        })
    }

    /// Descriptor stored in `env`, if any.
    pub fn load(env: &PlanBEnv) -> PlanBResult<Option<Self>> {
        let info = env.info_table();
        env.read(|txn| match info.get(txn, SCHEMA_KEY)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        })
    }

    /// Fail with `SchemaMismatch` unless `found` equals `self`.
    pub fn check(&self, store: &str, found: &SchemaInfo) -> PlanBResult<()> {
        if self == found {
            return Ok(());
        }
        Err(PlanBError::SchemaMismatch {
            store: store.to_string(),
            expected: self.describe(),
            found: found.describe(),
        })
    }

    /// Validate against the descriptor stored in `env`, writing this one
    /// first if the environment is writable and has none yet.
    pub fn ensure(&self, env: &PlanBEnv) -> PlanBResult<()> {
        match Self::load(env)? {
            Some(found) => self.check(env.name(), &found),
            None if env.is_read_only() => Err(PlanBError::SchemaMismatch {
                store: env.name().to_string(),
                expected: self.describe(),
                found: "no schema".into(),
            }),
            None => {
                let json = serde_json::to_vec(self)?;
                let info = env.info_table();
                env.write(move |w| Ok(info.put(w.txn()?, SCHEMA_KEY, &json)?))?;
                debug!(store = %env.name(), version = self.schema_version, "Stored schema");
                Ok(())
            }
        }
    }

    fn describe(&self) -> String {
        format!("v{} key={} value={}", self.schema_version, self.key_schema, self.value_schema)
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared flag polled between rows by long-running sweeps.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Shard trait
// ---------------------------------------------------------------------------

/// Operations every shard supports.
///
/// `insert` runs on the writer thread inside the caller's batch; everything
/// else is called from any thread.
pub trait Db: Send + Sync {
    type Key;
    type Value;

    fn name(&self) -> &str;

    fn env(&self) -> &PlanBEnv;

    fn schema_info(&self) -> &SchemaInfo;

    /// Add `value` under `key`, combining with any existing row.
    fn insert(&self, writer: &mut Writer<'_>, key: &Self::Key, value: &Self::Value) -> PlanBResult<()>;

    /// Point read in a fresh snapshot.
    fn get(&self, key: &Self::Key) -> PlanBResult<Option<Self::Value>>;

    /// Full scan. Each row matching `criteria` is projected onto `fields`
    /// and passed to `consumer`. Fields the criteria refer to are appended
    /// to `fields`.
    fn search(
        &self,
        criteria: &ExpressionCriteria,
        fields: &mut FieldIndex,
        consumer: &mut dyn FnMut(&[Val]),
    ) -> PlanBResult<()>;

    /// Fold the shard at `source` into this one and delete it.
    fn merge(&self, source: &Path) -> PlanBResult<()>;

    /// Delete rows strictly older than `cutoff`, by row time or insert
    /// time, then remove lookup rows nothing references. Returns the
    /// number of rows deleted.
    fn delete_old_data(
        &self,
        cutoff: DateTime<Utc>,
        use_insert_time: bool,
        interrupt: &Interrupt,
    ) -> PlanBResult<u64>;

    /// Roll fine-grained rows before `cutoff` into coarser ones. No shard
    /// condenses yet, so this reports zero rows changed.
    fn condense(&self, cutoff: DateTime<Utc>, _interrupt: &Interrupt) -> PlanBResult<u64> {
        debug!(store = %self.name(), cutoff = %cutoff, "Condense not supported, skipping");
        Ok(0)
    }

    /// Rows in the shard.
    fn count(&self) -> PlanBResult<u64>;

    /// Queue an insert on the writer without waiting.
    fn insert_async(&self, key: Self::Key, value: Self::Value) -> PlanBResult<CommitHandle>
    where
        Self: Clone + Sized + 'static,
        Self::Key: Send + 'static,
        Self::Value: Send + 'static,
    {
        let db = self.clone();
        self.env().writer()?.put_async(move |w| db.insert(w, &key, &value))
    }

    /// Queue an insert, blocking until the writer has taken it.
    fn insert_sync(&self, key: Self::Key, value: Self::Value) -> PlanBResult<CommitHandle>
    where
        Self: Clone + Sized + 'static,
        Self::Key: Send + 'static,
        Self::Value: Send + 'static,
    {
        let db = self.clone();
        self.env().writer()?.put_sync(move |w| db.insert(w, &key, &value))
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Merge the shard at `source` into `target` and delete it.
///
/// Pending work on `target` is committed first. `fold` receives the
/// read-only source environment and must apply the whole source in one
/// write on `target`. The source directory is only removed once that write
/// has committed; on any error both shards are left as they were.
pub fn merge_and_delete(
    target: &PlanBEnv,
    source: &Path,
    config: &Config,
    fold: impl FnOnce(&PlanBEnv) -> PlanBResult<u64>,
) -> PlanBResult<u64> {
    if source == target.path() {
        return Err(PlanBError::InvariantViolation(format!(
            "cannot merge {} into itself",
            source.display()
        )));
    }
    target.writer()?.commit_sync()?;

    let source_env = PlanBEnv::open_read_only(source, target.name(), config)?;
    let folded = fold(&source_env);
    source_env.close()?;
    let rows = folded?;

    platform_durability::remove_dir_durably(source).map_err(|e| PlanBError::from(e).with_path(source))?;
    info!(store = %target.name(), source = %source.display(), rows, "Merged shard");
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub deleted: u64,
    pub kept: u64,
    pub lookups_deleted: u64,
    pub interrupted: bool,
}

/// Retention sweep over `table`, run on the writer thread.
///
/// Rows for which `row_time` is strictly before `before_ms` are deleted,
/// committing as the writer's thresholds are reached. Surviving rows are
/// passed to `record_used` so their lookup ids are kept. An error from
/// either callback fails the whole sweep before any lookup is collected. Once the whole
/// table has been scanned the unused lookup rows are deleted. An
/// interrupted sweep keeps what it deleted but skips lookup collection,
/// since rows it never reached may still reference anything.
pub fn delete_old_rows(
    writer: &mut Writer<'_>,
    table: Table,
    before_ms: i64,
    interrupt: &Interrupt,
    used: &mut UsedLookups,
    mut row_time: impl FnMut(&[u8], &[u8]) -> PlanBResult<i64>,
    mut record_used: impl FnMut(&mut UsedLookups, &[u8], &[u8]) -> PlanBResult<()>,
) -> PlanBResult<SweepStats> {
    writer.commit()?;
    let mut stats = SweepStats::default();
    let mut last: Option<Vec<u8>> = None;

    'scan: loop {
        let batch = read_batch(writer.txn()?, table, last.as_deref())?;
        let Some((tail, _)) = batch.last() else { break };
        let tail = tail.clone();

        for (key, value) in &batch {
            if interrupt.is_interrupted() {
                stats.interrupted = true;
                break 'scan;
            }
            if row_time(key, value)? < before_ms {
                table.delete(writer.txn()?, key)?;
                writer.increment_change_count();
                writer.try_commit()?;
                stats.deleted += 1;
            } else {
                record_used(used, key, value)?;
                stats.kept += 1;
            }
        }
        last = Some(tail);
    }

    if stats.interrupted {
        info!(store = %writer.store(), deleted = stats.deleted, "Retention sweep interrupted, skipping lookup cleanup");
    } else if !used.is_empty() {
        stats.lookups_deleted = used.delete_unused(writer)?;
    }
    writer.commit()?;

    info!(
        store = %writer.store(),
        deleted = stats.deleted,
        kept = stats.kept,
        lookups_deleted = stats.lookups_deleted,
        "Retention sweep finished"
    );
    Ok(stats)
}

fn read_batch(txn: &RoTxn<'_>, table: Table, after: Option<&[u8]>) -> PlanBResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let range: (Bound<&[u8]>, Bound<&[u8]>) = match after {
        Some(key) => (Bound::Excluded(key), Bound::Unbounded),
        None => (Bound::Unbounded, Bound::Unbounded),
    };
    let mut batch = Vec::with_capacity(RETENTION_BATCH);
    for entry in table.range(txn, &range)? {
        let (key, value) = entry?;
        batch.push((key.to_vec(), value.to_vec()));
        if batch.len() == RETENTION_BATCH {
            break;
        }
    }
    Ok(batch)
}

/// Epoch millis of `cutoff`.
pub fn cutoff_millis(cutoff: DateTime<Utc>) -> i64 {
    cutoff.timestamp_millis()
}
