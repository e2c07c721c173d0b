//! Key/value state shard
//!
//! Holds one value per key. With `overwrite` set (the default) a later
//! insert replaces the stored value; without it the first value written for
//! a key is kept and later inserts are ignored.
//!
//! # Row layout
//!
//! ```text
//! key:   [key (key codec)]
//! value: [insert time ms (8)][value (value codec)]
//! ```
//!
//! State rows carry no event time, so retention always works on the insert
//! time.

use std::path::Path;

use chrono::{DateTime, Utc};
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use planb_core::codec::MAX_KEY_LENGTH;
use planb_core::db::{self, Db, Interrupt, SchemaInfo};
use planb_core::{
    BufferPool, Config, ExpressionCriteria, FieldIndex, FieldType, HashLength, PlanBEnv,
    PlanBResult, Table, UsedLookups, Val, ValCodec, Writer,
};

use crate::rows::{self, now_millis};

const COMPONENT: &str = "state row";
const HEADER_BYTES: usize = 8;

/// Settings fixed when a state shard is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSettings {
    pub key_type: FieldType,
    pub value_type: FieldType,
    pub hash_length: HashLength,
    pub overwrite: bool,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            key_type: FieldType::String,
            value_type: FieldType::String,
            hash_length: HashLength::Long,
            overwrite: true,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateKeySchema {
    key_type: FieldType,
    hash_length: HashLength,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateValueSchema {
    value_type: FieldType,
    hash_length: HashLength,
    overwrite: bool,
}

/// Projectable state fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    Key,
    Value,
    InsertTime,
}

impl StateField {
    pub fn parse(name: &str) -> Option<StateField> {
        [("Key", StateField::Key), ("Value", StateField::Value), ("InsertTime", StateField::InsertTime)]
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| f)
    }
}

/// Key/value state shard.
#[derive(Clone)]
pub struct StateDb {
    env: PlanBEnv,
    config: Config,
    settings: StateSettings,
    schema: SchemaInfo,
    table: Table,
    key_codec: ValCodec,
    value_codec: ValCodec,
    pool: BufferPool,
}

impl StateDb {
    pub fn open(path: &Path, name: &str, settings: StateSettings, config: &Config) -> PlanBResult<Self> {
        let env = PlanBEnv::open(path, name, config)?;
        Self::attach(env, settings, config)
    }

    pub fn attach(env: PlanBEnv, settings: StateSettings, config: &Config) -> PlanBResult<Self> {
        let schema = SchemaInfo::new(
            &StateKeySchema { key_type: settings.key_type, hash_length: settings.hash_length },
            &StateValueSchema {
                value_type: settings.value_type,
                hash_length: settings.hash_length,
                overwrite: settings.overwrite,
            },
        )?;
        schema.ensure(&env)?;

        let key_codec = settings.key_type.codec(&env, "state_key_lookup", settings.hash_length, Some(MAX_KEY_LENGTH))?;
        let value_codec = settings.value_type.codec(&env, "state_value_lookup", settings.hash_length, None)?;
        let table = env.open_table("state")?;
        debug!(store = %env.name(), ?settings, "Opened state shard");

        Ok(Self {
            env,
            config: config.clone(),
            settings,
            schema,
            table,
            key_codec,
            value_codec,
            pool: BufferPool::new(),
        })
    }

    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn settings(&self) -> &StateSettings {
        &self.settings
    }

    pub fn close(self) -> PlanBResult<()> {
        self.env.close()
    }

    /// Store `value` under `key` unless the shard keeps first values or the
    /// stored row was inserted later. Returns whether the row was written.
    fn put(&self, txn: &mut RwTxn<'_>, key: &Val, value: &Val, insert_time: i64) -> PlanBResult<bool> {
        self.pool.with_buffer(64, |key_bytes| {
            self.key_codec.write(txn, key, |encoded| {
                key_bytes.extend_from_slice(encoded);
                Ok(())
            })?;

            if let Some(existing) = self.table.get(txn, key_bytes)? {
                let existing_at = rows::read_millis(existing, 0, COMPONENT)?;
                if !self.settings.overwrite || existing_at > insert_time {
                    return Ok(false);
                }
            }

            self.pool.with_buffer(HEADER_BYTES + 64, |row| {
                rows::put_millis(row, insert_time);
                self.value_codec.write(txn, value, |encoded| {
                    row.extend_from_slice(encoded);
                    Ok(())
                })?;
                self.table.put(txn, key_bytes, row)?;
                Ok(true)
            })
        })
    }

    fn decode_value(&self, txn: &RoTxn<'_>, row: &[u8]) -> PlanBResult<(i64, Val)> {
        let (_, value) = rows::split(row, HEADER_BYTES, COMPONENT)?;
        Ok((rows::read_millis(row, 0, COMPONENT)?, self.value_codec.read(txn, value)?))
    }

    fn extract(&self, txn: &RoTxn<'_>, fields: &[Option<StateField>], key: &[u8], row: &[u8]) -> PlanBResult<Vec<Val>> {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push(match field {
                Some(StateField::Key) => self.key_codec.read(txn, key)?,
                Some(StateField::Value) => self.decode_value(txn, row)?.1,
                Some(StateField::InsertTime) => Val::Date(rows::read_millis(row, 0, COMPONENT)?),
                None => Val::Null,
            });
        }
        Ok(values)
    }
}

impl Db for StateDb {
    type Key = Val;
    type Value = Val;

    fn name(&self) -> &str {
        self.env.name()
    }

    fn env(&self) -> &PlanBEnv {
        &self.env
    }

    fn schema_info(&self) -> &SchemaInfo {
        &self.schema
    }

    fn insert(&self, writer: &mut Writer<'_>, key: &Val, value: &Val) -> PlanBResult<()> {
        self.put(writer.txn()?, key, value, now_millis()).map(|_| ())
    }

    fn get(&self, key: &Val) -> PlanBResult<Option<Val>> {
        self.env.read(|txn| {
            self.key_codec.to_lookup(txn, key, |encoded| {
                let Some(encoded) = encoded else { return Ok(None) };
                match self.table.get(txn, encoded)? {
                    Some(row) => Ok(Some(self.decode_value(txn, row)?.1)),
                    None => Ok(None),
                }
            })
        })
    }

    fn search(
        &self,
        criteria: &ExpressionCriteria,
        fields: &mut FieldIndex,
        consumer: &mut dyn FnMut(&[Val]),
    ) -> PlanBResult<()> {
        let predicate = criteria.compile(fields);
        let columns: Vec<Option<StateField>> = fields.fields().iter().map(|f| StateField::parse(f)).collect();
        self.env.read(|txn| {
            for entry in self.table.iter(txn)? {
                let (key, row) = entry?;
                let values = self.extract(txn, &columns, key, row)?;
                if predicate.test(&values) {
                    consumer(&values);
                }
            }
            Ok(())
        })
    }

    /// Copy every source row in, keeping whichever side of a shared key
    /// was inserted more recently.
    fn merge(&self, source: &Path) -> PlanBResult<()> {
        let target = self.clone();
        db::merge_and_delete(&self.env, source, &self.config, move |source_env| {
            let source = StateDb::attach(source_env.clone(), target.settings, &target.config)?;
            let dest = target.clone();
            target.env.write(move |w| {
                let mut written = 0u64;
                source.env.read(|stxn| {
                    for entry in source.table.iter(stxn)? {
                        let (key, row) = entry?;
                        let key = source.key_codec.read(stxn, key)?;
                        let (insert_time, value) = source.decode_value(stxn, row)?;
                        if dest.put(w.txn()?, &key, &value, insert_time)? {
                            written += 1;
                        }
                    }
                    Ok(())
                })?;
                Ok(written)
            })
        })?;
        Ok(())
    }

    fn delete_old_data(
        &self,
        cutoff: DateTime<Utc>,
        _use_insert_time: bool,
        interrupt: &Interrupt,
    ) -> PlanBResult<u64> {
        let shard = self.clone();
        let interrupt = interrupt.clone();
        let before = db::cutoff_millis(cutoff);
        let stats = self.env.write(move |w| {
            let mut used = UsedLookups::for_codecs(&shard.key_codec, Some(&shard.value_codec));
            db::delete_old_rows(
                w,
                shard.table,
                before,
                &interrupt,
                &mut used,
                |_, row| rows::read_millis(row, 0, COMPONENT),
                |used, key, row| {
                    used.record_key(key);
                    used.record_value(rows::split(row, HEADER_BYTES, COMPONENT)?.1);
                    Ok(())
                },
            )
        })?;
        Ok(stats.deleted)
    }

    fn count(&self) -> PlanBResult<u64> {
        self.env.read(|txn| Ok(self.table.len(txn)?))
    }
}

impl std::fmt::Debug for StateDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateDb")
            .field("name", &self.env.name())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use planb_core::lookup::HashLookupDb;
    use planb_core::{Condition, ExpressionItem, PlanBError};
    use tempfile::TempDir;

    fn test_db(settings: StateSettings) -> (StateDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = StateDb::open(&dir.path().join("state"), "state-test", settings, &Config::budget()).unwrap();
        (db, dir)
    }

    fn set(db: &StateDb, key: impl Into<Val>, value: impl Into<Val>) {
        let (shard, key, value) = (db.clone(), key.into(), value.into());
        db.env().write(move |w| shard.insert(w, &key, &value)).unwrap();
    }

    fn put_at(db: &StateDb, key: &str, value: &str, insert_time: i64) {
        let (shard, key, value) = (db.clone(), Val::string(key), Val::string(value));
        db.env().write(move |w| shard.put(w.txn()?, &key, &value, insert_time)).unwrap();
    }

    #[test]
    fn test_insert_overwrites() {
        let (db, _dir) = test_db(StateSettings::default());
        set(&db, "colour", "red");
        set(&db, "colour", "blue");
        set(&db, "size", "large");

        assert_eq!(db.get(&Val::string("colour")).unwrap(), Some(Val::string("blue")));
        assert_eq!(db.get(&Val::string("missing")).unwrap(), None);
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_without_overwrite_first_value_wins() {
        let (db, _dir) = test_db(StateSettings { overwrite: false, ..StateSettings::default() });
        set(&db, "colour", "red");
        set(&db, "colour", "blue");
        assert_eq!(db.get(&Val::string("colour")).unwrap(), Some(Val::string("red")));
    }

    #[test]
    fn test_typed_keys_and_values() {
        let settings = StateSettings {
            key_type: FieldType::Long,
            value_type: FieldType::Double,
            ..StateSettings::default()
        };
        let (db, _dir) = test_db(settings);
        set(&db, Val::Long(-3), Val::Double(1.5));
        set(&db, Val::Long(i64::MAX), Val::Double(-2.0));

        assert_eq!(db.get(&Val::Long(-3)).unwrap(), Some(Val::Double(1.5)));
        assert_eq!(db.get(&Val::Long(i64::MAX)).unwrap(), Some(Val::Double(-2.0)));
    }

    #[test]
    fn test_older_insert_does_not_replace_newer() {
        let (db, _dir) = test_db(StateSettings::default());
        put_at(&db, "k", "newer", 2_000);
        put_at(&db, "k", "older", 1_000);
        assert_eq!(db.get(&Val::string("k")).unwrap(), Some(Val::string("newer")));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let (db, _dir) = test_db(StateSettings::default());
        let (shard, key) = (db.clone(), Val::string("k".repeat(MAX_KEY_LENGTH + 1)));
        let err = db.env().write(move |w| shard.insert(w, &key, &Val::string("v"))).unwrap_err();
        assert!(matches!(err, PlanBError::SizeExceeded { .. }));
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_retention_collects_unused_values() {
        let settings = StateSettings { value_type: FieldType::HashLookup, ..StateSettings::default() };
        let (db, _dir) = test_db(settings);
        put_at(&db, "stale", "old payload", 1_000);
        set(&db, "fresh", "new payload");

        let cutoff = Utc::now() - TimeDelta::hours(1);
        assert_eq!(db.delete_old_data(cutoff, false, &Interrupt::new()).unwrap(), 1);
        assert_eq!(db.get(&Val::string("stale")).unwrap(), None);
        assert_eq!(db.get(&Val::string("fresh")).unwrap(), Some(Val::string("new payload")));

        let values = HashLookupDb::open(db.env(), "state_value_lookup", HashLength::Long).unwrap();
        assert_eq!(db.env().read(|txn| values.len(txn)).unwrap(), 1);
    }

    #[test]
    fn test_search_by_value() {
        let (db, _dir) = test_db(StateSettings::default());
        set(&db, "a", "disk full");
        set(&db, "b", "cpu hot");

        let mut fields = FieldIndex::of(["Key"]);
        let criteria = ExpressionCriteria::new(ExpressionItem::term("Value", Condition::Contains("cpu".into())));
        let mut rows = Vec::new();
        db.search(&criteria, &mut fields, &mut |row| rows.push(row.to_vec())).unwrap();
        assert_eq!(rows, vec![vec![Val::string("b"), Val::string("cpu hot")]]);
    }
}
