//! Append-only topic log
//!
//! Messages are appended per topic under a monotonically increasing
//! sequence number and never combined.
//!
//! # Row layout
//!
//! ```text
//! key:   [topic][sequence u64 BE (8)]
//! value: [event time ms (8)][insert time ms (8)][payload (value codec)]
//! ```
//!
//! Variable-width topics carry a two byte length prefix so that no topic's
//! rows fall inside another topic's key range.
//!
//! The next sequence of each topic is kept in the `topic_sequence` table,
//! keyed by the same prefix, so sequences keep increasing after retention
//! has emptied a topic.

use std::ops::Bound;
use std::path::Path;

use chrono::{DateTime, Utc};
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use planb_core::codec::MAX_KEY_LENGTH;
use planb_core::db::{self, Db, Interrupt, SchemaInfo};
use planb_core::{
    BufferPool, Config, ExpressionCriteria, FieldIndex, FieldType, HashLength, PlanBEnv,
    PlanBError, PlanBResult, Table, UsedLookups, Val, ValCodec, Writer,
};

use crate::rows::{self, now_millis, unsigned_val};

const COMPONENT: &str = "topic row";
const SEQUENCE_BYTES: usize = 8;
const LENGTH_PREFIX_BYTES: usize = 2;
const HEADER_BYTES: usize = 16;

/// Settings fixed when a topic shard is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSettings {
    pub topic_type: FieldType,
    pub payload_type: FieldType,
    pub hash_length: HashLength,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            topic_type: FieldType::String,
            payload_type: FieldType::String,
            hash_length: HashLength::Long,
        }
    }
}

/// Key schema persisted for topic shards.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicKeySchema {
    topic_type: FieldType,
    hash_length: HashLength,
}

/// Value schema persisted for topic shards.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicValueSchema {
    payload_type: FieldType,
    hash_length: HashLength,
}

/// One message as submitted and as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicMessage {
    pub event_time: i64,
    pub payload: Val,
}

impl TopicMessage {
    pub fn new(event_time: DateTime<Utc>, payload: impl Into<Val>) -> Self {
        Self { event_time: event_time.timestamp_millis(), payload: payload.into() }
    }
}

/// A stored message with its position in the topic.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicEntry {
    pub sequence: u64,
    pub insert_time: i64,
    pub message: TopicMessage,
}

/// Projectable topic fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicField {
    Topic,
    Sequence,
    EventTime,
    InsertTime,
    Payload,
}

impl TopicField {
    pub fn parse(name: &str) -> Option<TopicField> {
        [
            ("Topic", TopicField::Topic),
            ("Sequence", TopicField::Sequence),
            ("EventTime", TopicField::EventTime),
            ("InsertTime", TopicField::InsertTime),
            ("Payload", TopicField::Payload),
        ]
        .into_iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, f)| f)
    }
}

/// Topic log shard.
#[derive(Clone)]
pub struct TopicDb {
    env: PlanBEnv,
    config: Config,
    settings: TopicSettings,
    schema: SchemaInfo,
    table: Table,
    sequences: Table,
    topic_codec: ValCodec,
    payload_codec: ValCodec,
    pool: BufferPool,
}

impl TopicDb {
    pub fn open(path: &Path, name: &str, settings: TopicSettings, config: &Config) -> PlanBResult<Self> {
        let env = PlanBEnv::open(path, name, config)?;
        Self::attach(env, settings, config)
    }

    pub fn attach(env: PlanBEnv, settings: TopicSettings, config: &Config) -> PlanBResult<Self> {
        let schema = SchemaInfo::new(
            &TopicKeySchema { topic_type: settings.topic_type, hash_length: settings.hash_length },
            &TopicValueSchema { payload_type: settings.payload_type, hash_length: settings.hash_length },
        )?;
        schema.ensure(&env)?;

        let max_topic = MAX_KEY_LENGTH - SEQUENCE_BYTES - LENGTH_PREFIX_BYTES;
        let topic_codec = settings.topic_type.codec(&env, "topic_key_lookup", settings.hash_length, Some(max_topic))?;
        let payload_codec = settings.payload_type.codec(&env, "topic_payload_lookup", settings.hash_length, None)?;
        let table = env.open_table("topic")?;
        let sequences = env.open_table("topic_sequence")?;
        debug!(store = %env.name(), ?settings, "Opened topic shard");

        Ok(Self {
            env,
            config: config.clone(),
            settings,
            schema,
            table,
            sequences,
            topic_codec,
            payload_codec,
            pool: BufferPool::new(),
        })
    }

    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn settings(&self) -> &TopicSettings {
        &self.settings
    }

    pub fn close(self) -> PlanBResult<()> {
        self.env.close()
    }

    /// Up to `limit` messages of `topic` starting at sequence `from`.
    pub fn read(&self, topic: &Val, from: u64, limit: usize) -> PlanBResult<Vec<TopicEntry>> {
        self.env.read(|txn| {
            self.topic_codec.to_lookup(txn, topic, |encoded| {
                let Some(encoded) = encoded else { return Ok(Vec::new()) };
                let prefix = self.prefix(encoded);
                let mut start = prefix.clone();
                start.extend_from_slice(&from.to_be_bytes());

                let range: (Bound<&[u8]>, Bound<&[u8]>) = (Bound::Included(start.as_slice()), Bound::Unbounded);
                let mut entries = Vec::new();
                for entry in self.table.range(txn, &range)? {
                    let (key, value) = entry?;
                    if entries.len() == limit || !key.starts_with(&prefix) {
                        break;
                    }
                    entries.push(self.decode_entry(txn, key, value)?);
                }
                Ok(entries)
            })
        })
    }

    /// Encoded topic with its length prefix if the codec is variable width.
    fn prefix(&self, topic: &[u8]) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(topic.len() + LENGTH_PREFIX_BYTES);
        if self.topic_codec.fixed_size().is_none() {
            // Topics are at most MAX_KEY_LENGTH bytes, so the length fits.
            prefix.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        }
        prefix.extend_from_slice(topic);
        prefix
    }

    /// Split a row key into (encoded topic, sequence).
    fn split_key<'k>(&self, key: &'k [u8]) -> PlanBResult<(&'k [u8], u64)> {
        let at = key.len().checked_sub(SEQUENCE_BYTES).ok_or_else(|| {
            PlanBError::corrupt(COMPONENT, format!("key of {} bytes", key.len()))
        })?;
        let (prefix, sequence) = key.split_at(at);
        let topic = match self.topic_codec.fixed_size() {
            Some(_) => prefix,
            None => rows::split(prefix, LENGTH_PREFIX_BYTES, COMPONENT)?.1,
        };
        Ok((topic, decode_sequence(sequence)?))
    }

    fn decode_entry(&self, txn: &RoTxn<'_>, key: &[u8], value: &[u8]) -> PlanBResult<TopicEntry> {
        let (_, sequence) = self.split_key(key)?;
        Ok(TopicEntry {
            sequence,
            insert_time: rows::read_millis(value, 8, COMPONENT)?,
            message: self.decode_message(txn, value)?,
        })
    }

    fn decode_message(&self, txn: &RoTxn<'_>, value: &[u8]) -> PlanBResult<TopicMessage> {
        let (_, payload) = rows::split(value, HEADER_BYTES, COMPONENT)?;
        Ok(TopicMessage {
            event_time: rows::read_millis(value, 0, COMPONENT)?,
            payload: self.payload_codec.read(txn, payload)?,
        })
    }

    /// Append `message` to `topic` with the next sequence number.
    fn append(&self, txn: &mut RwTxn<'_>, topic: &Val, message: &TopicMessage, insert_time: i64) -> PlanBResult<u64> {
        self.pool.with_buffer(64, |key| {
            self.topic_codec.write(txn, topic, |encoded| {
                key.extend_from_slice(&self.prefix(encoded));
                Ok(())
            })?;

            let sequence = match self.sequences.get(txn, key)? {
                Some(next) => decode_sequence(next)?,
                None => 0,
            };
            self.sequences.put(txn, key, &(sequence + 1).to_be_bytes())?;
            key.extend_from_slice(&sequence.to_be_bytes());

            self.pool.with_buffer(HEADER_BYTES + 64, |value| {
                rows::put_millis(value, message.event_time);
                rows::put_millis(value, insert_time);
                self.payload_codec.write(txn, &message.payload, |payload| {
                    value.extend_from_slice(payload);
                    Ok(())
                })?;
                self.table.put(txn, key, value)?;
                Ok(sequence)
            })
        })
    }

    fn extract(&self, txn: &RoTxn<'_>, fields: &[Option<TopicField>], key: &[u8], value: &[u8]) -> PlanBResult<Vec<Val>> {
        let (topic, sequence) = self.split_key(key)?;
        let mut row = Vec::with_capacity(fields.len());
        for field in fields {
            row.push(match field {
                Some(TopicField::Topic) => self.topic_codec.read(txn, topic)?,
                Some(TopicField::Sequence) => unsigned_val(sequence),
                Some(TopicField::EventTime) => Val::Date(rows::read_millis(value, 0, COMPONENT)?),
                Some(TopicField::InsertTime) => Val::Date(rows::read_millis(value, 8, COMPONENT)?),
                Some(TopicField::Payload) => self.decode_message(txn, value)?.payload,
                None => Val::Null,
            });
        }
        Ok(row)
    }
}

impl Db for TopicDb {
    type Key = Val;
    type Value = TopicMessage;

    fn name(&self) -> &str {
        self.env.name()
    }

    fn env(&self) -> &PlanBEnv {
        &self.env
    }

    fn schema_info(&self) -> &SchemaInfo {
        &self.schema
    }

    fn insert(&self, writer: &mut Writer<'_>, topic: &Val, message: &TopicMessage) -> PlanBResult<()> {
        self.append(writer.txn()?, topic, message, now_millis()).map(|_| ())
    }

    /// Latest message on `topic`.
    fn get(&self, topic: &Val) -> PlanBResult<Option<TopicMessage>> {
        self.env.read(|txn| {
            self.topic_codec.to_lookup(txn, topic, |encoded| {
                let Some(encoded) = encoded else { return Ok(None) };
                let prefix = self.prefix(encoded);
                match self.table.rev_prefix_iter(txn, &prefix)?.next() {
                    Some(entry) => Ok(Some(self.decode_message(txn, entry?.1)?)),
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
        let columns: Vec<Option<TopicField>> = fields.fields().iter().map(|f| TopicField::parse(f)).collect();
        self.env.read(|txn| {
            for entry in self.table.iter(txn)? {
                let (key, value) = entry?;
                let row = self.extract(txn, &columns, key, value)?;
                if predicate.test(&row) {
                    consumer(&row);
                }
            }
            Ok(())
        })
    }

    fn merge(&self, source: &Path) -> PlanBResult<()> {
        let target = self.clone();
        db::merge_and_delete(&self.env, source, &self.config, move |source_env| {
            let source = TopicDb::attach(source_env.clone(), target.settings, &target.config)?;
            let dest = target.clone();
            target.env.write(move |w| {
                let mut rows = 0u64;
                source.env.read(|stxn| {
                    for entry in source.table.iter(stxn)? {
                        let (key, value) = entry?;
                        let (topic, _) = source.split_key(key)?;
                        let topic = source.topic_codec.read(stxn, topic)?;
                        let message = source.decode_message(stxn, value)?;
                        let insert_time = rows::read_millis(value, 8, COMPONENT)?;
                        dest.append(w.txn()?, &topic, &message, insert_time)?;
                        rows += 1;
                    }
                    Ok(())
                })?;
                Ok(rows)
            })
        })?;
        Ok(())
    }

    fn delete_old_data(
        &self,
        cutoff: DateTime<Utc>,
        use_insert_time: bool,
        interrupt: &Interrupt,
    ) -> PlanBResult<u64> {
        let shard = self.clone();
        let interrupt = interrupt.clone();
        let before = db::cutoff_millis(cutoff);
        let time_at = if use_insert_time { 8 } else { 0 };
        let stats = self.env.write(move |w| {
            let mut used = UsedLookups::for_codecs(&shard.topic_codec, Some(&shard.payload_codec));
            db::delete_old_rows(
                w,
                shard.table,
                before,
                &interrupt,
                &mut used,
                |_, value| rows::read_millis(value, time_at, COMPONENT),
                |used, key, value| {
                    used.record_key(shard.split_key(key)?.0);
                    used.record_value(rows::split(value, HEADER_BYTES, COMPONENT)?.1);
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

fn decode_sequence(bytes: &[u8]) -> PlanBResult<u64> {
    let raw: [u8; SEQUENCE_BYTES] = bytes.try_into().map_err(|_| {
        PlanBError::corrupt(COMPONENT, format!("sequence of {} bytes", bytes.len()))
    })?;
    Ok(u64::from_be_bytes(raw))
}

impl std::fmt::Debug for TopicDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicDb")
            .field("name", &self.env.name())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use planb_core::{Condition, ExpressionItem};
    use tempfile::TempDir;

    fn test_db(settings: TopicSettings) -> (TopicDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = TopicDb::open(&dir.path().join("topic"), "topic-test", settings, &Config::budget()).unwrap();
        (db, dir)
    }

    fn publish(db: &TopicDb, topic: &str, minute: u32, payload: &str) {
        let shard = db.clone();
        let topic = Val::string(topic);
        let message = TopicMessage::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(), payload);
        db.env().write(move |w| shard.insert(w, &topic, &message)).unwrap();
    }

    #[test]
    fn test_append_and_read_back() {
        let (db, _dir) = test_db(TopicSettings::default());
        publish(&db, "alerts", 1, "first");
        publish(&db, "alerts", 2, "second");
        publish(&db, "alert", 3, "other topic");
        publish(&db, "alerts", 4, "third");

        let latest = db.get(&Val::string("alerts")).unwrap().unwrap();
        assert_eq!(latest.payload, Val::string("third"));

        let entries = db.read(&Val::string("alerts"), 1, 10).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(entries[0].message.payload, Val::string("second"));

        assert_eq!(db.read(&Val::string("alert"), 0, 10).unwrap().len(), 1);
        assert_eq!(db.read(&Val::string("alerts"), 0, 2).unwrap().len(), 2);
        assert_eq!(db.get(&Val::string("missing")).unwrap(), None);
        assert_eq!(db.count().unwrap(), 4);
    }

    #[test]
    fn test_interned_payloads() {
        let settings = TopicSettings { payload_type: FieldType::HashLookup, ..TopicSettings::default() };
        let (db, _dir) = test_db(settings);
        let big = "p".repeat(5000);
        publish(&db, "t", 1, &big);
        publish(&db, "t", 2, &big);

        let entries = db.read(&Val::string("t"), 0, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.message.payload == Val::string(big.as_str())));
    }

    #[test]
    fn test_retention_by_event_time() {
        let settings = TopicSettings { topic_type: FieldType::UidLookup, ..TopicSettings::default() };
        let (db, _dir) = test_db(settings);
        publish(&db, "old", 1, "a");
        publish(&db, "new", 30, "b");

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        assert_eq!(db.delete_old_data(cutoff, false, &Interrupt::new()).unwrap(), 1);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.get(&Val::string("old")).unwrap(), None);
        assert!(db.get(&Val::string("new")).unwrap().is_some());
    }

    #[test]
    fn test_sequence_survives_retention() {
        let (db, _dir) = test_db(TopicSettings::default());
        publish(&db, "jobs", 1, "a");
        publish(&db, "jobs", 2, "b");

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap();
        assert_eq!(db.delete_old_data(cutoff, false, &Interrupt::new()).unwrap(), 2);
        assert_eq!(db.count().unwrap(), 0);

        publish(&db, "jobs", 20, "c");
        let entries = db.read(&Val::string("jobs"), 2, 10).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, 2);
        assert_eq!(entries[0].message.payload, Val::string("c"));
    }

    #[test]
    fn test_unreadable_row_fails_retention() {
        let settings = TopicSettings { payload_type: FieldType::HashLookup, ..TopicSettings::default() };
        let (db, _dir) = test_db(settings);
        publish(&db, "jobs", 1, "kept");

        let table = db.table;
        db.env()
            .write(move |w| {
                let mut value = Vec::new();
                rows::put_millis(&mut value, i64::MAX);
                rows::put_millis(&mut value, i64::MAX);
                Ok(table.put(w.txn()?, b"x", &value)?)
            })
            .unwrap();

        let cutoff = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let err = db.delete_old_data(cutoff, false, &Interrupt::new()).unwrap_err();
        assert!(matches!(err, PlanBError::Corrupt { .. }), "unexpected error: {err}");
        assert_eq!(db.count().unwrap(), 2);
        assert_eq!(db.get(&Val::string("jobs")).unwrap().unwrap().payload, Val::string("kept"));
    }

    #[test]
    fn test_search_by_payload() {
        let (db, _dir) = test_db(TopicSettings::default());
        publish(&db, "a", 1, "disk full");
        publish(&db, "b", 2, "cpu hot");

        let mut fields = FieldIndex::of(["Topic", "Sequence"]);
        let criteria = ExpressionCriteria::new(ExpressionItem::term(
            "Payload",
            Condition::Contains("disk".into()),
        ));
        let mut rows = Vec::new();
        db.search(&criteria, &mut fields, &mut |row| rows.push(row.to_vec())).unwrap();
        assert_eq!(rows, vec![vec![Val::string("a"), Val::Long(0), Val::string("disk full")]]);
    }
}
