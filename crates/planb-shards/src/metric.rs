//! Time-bucketed metric aggregator
//!
//! Each row holds the running aggregate of one subject within one time
//! bucket. Event times are truncated to the configured
//! [`TemporalResolution`], so every event for the same subject in the same
//! bucket lands on the same row and is folded into it.
//!
//! # Row layout
//!
//! ```text
//! key:   [subject (key codec)][bucket start ms (8)]
//! value: [insert time ms (8)][latest (w)][min (w)][max (w)][count (8)][sum (8)]
//! ```
//!
//! `w` is the configured value width (1 to 8 bytes). Count and sum always
//! use 8 bytes.

use std::path::Path;

use chrono::{DateTime, Utc};
use heed::{RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use planb_core::codec::{MAX_KEY_LENGTH, TimeCodec};
use planb_core::db::{self, Db, Interrupt, SchemaInfo};
use planb_core::{
    BufferPool, Config, ExpressionCriteria, FieldIndex, FieldType, HashLength, PlanBEnv,
    PlanBError, PlanBResult, Table, TemporalResolution, UnsignedBytes, UsedLookups, Val, ValCodec,
    Writer,
};

use crate::rows::{self, now_millis, unsigned_val};

const COMPONENT: &str = "metric row";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// How metric keys are encoded. Persisted as the key schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKeySchema {
    pub key_type: FieldType,
    pub hash_length: HashLength,
    pub temporal_resolution: TemporalResolution,
}

/// How metric values are encoded. Persisted as the value schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValueSchema {
    pub value_width: UnsignedBytes,
}

/// Settings fixed when a metric shard is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSettings {
    pub key_schema: MetricKeySchema,
    pub value_schema: MetricValueSchema,
}

impl Default for MetricSettings {
    fn default() -> Self {
        Self {
            key_schema: MetricKeySchema {
                key_type: FieldType::String,
                hash_length: HashLength::Integer,
                temporal_resolution: TemporalResolution::Hour,
            },
            value_schema: MetricValueSchema { value_width: UnsignedBytes::EIGHT },
        }
    }
}

impl MetricSettings {
    pub fn with_key_type(mut self, key_type: FieldType) -> Self {
        self.key_schema.key_type = key_type;
        self
    }

    pub fn with_resolution(mut self, resolution: TemporalResolution) -> Self {
        self.key_schema.temporal_resolution = resolution;
        self
    }

    pub fn with_value_width(mut self, width: u8) -> PlanBResult<Self> {
        self.value_schema.value_width = UnsignedBytes::new(width)?;
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Keys and values
// ---------------------------------------------------------------------------

/// Subject and event time. The time is truncated to the shard's bucket
/// resolution when stored.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricKey {
    pub subject: Val,
    pub time: i64,
}

impl MetricKey {
    pub fn new(subject: impl Into<Val>, time: DateTime<Utc>) -> Self {
        Self { subject: subject.into(), time: time.timestamp_millis() }
    }

    pub fn at_millis(subject: impl Into<Val>, time: i64) -> Self {
        Self { subject: subject.into(), time }
    }
}

/// Additive aggregate of the events in one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricValue {
    pub latest: u64,
    pub min: u64,
    pub max: u64,
    pub count: u64,
    pub sum: u64,
}

impl MetricValue {
    /// Aggregate seeded from a single event.
    pub fn single(value: u64) -> Self {
        Self { latest: value, min: value, max: value, count: 1, sum: value }
    }

    /// Fold `incoming` into `self`; `incoming` is the more recent and
    /// supplies `latest`.
    pub fn combine(&self, incoming: &MetricValue) -> PlanBResult<MetricValue> {
        let overflow = |a: u64, b: u64| PlanBError::ValueOutOfRange {
            value: i128::from(a) + i128::from(b),
            width: 8,
        };
        Ok(MetricValue {
            latest: incoming.latest,
            min: self.min.min(incoming.min),
            max: self.max.max(incoming.max),
            count: self.count.checked_add(incoming.count).ok_or_else(|| overflow(self.count, incoming.count))?,
            sum: self.sum.checked_add(incoming.sum).ok_or_else(|| overflow(self.sum, incoming.sum))?,
        })
    }

    /// `sum / count`, or 0 for an empty aggregate.
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    fn write(&self, buf: &mut Vec<u8>, width: UnsignedBytes) -> PlanBResult<()> {
        width.put(buf, self.latest)?;
        width.put(buf, self.min)?;
        width.put(buf, self.max)?;
        UnsignedBytes::EIGHT.put(buf, self.count)?;
        UnsignedBytes::EIGHT.put(buf, self.sum)
    }

    fn read(bytes: &[u8], width: UnsignedBytes) -> PlanBResult<MetricValue> {
        let w = width.width();
        let expected = 3 * w + 16;
        if bytes.len() != expected {
            return Err(PlanBError::corrupt(
                COMPONENT,
                format!("aggregate of {} bytes, expected {}", bytes.len(), expected),
            ));
        }
        Ok(MetricValue {
            latest: width.get(bytes)?,
            min: width.get(&bytes[w..])?,
            max: width.get(&bytes[2 * w..])?,
            count: UnsignedBytes::EIGHT.get(&bytes[3 * w..])?,
            sum: UnsignedBytes::EIGHT.get(&bytes[3 * w + 8..])?,
        })
    }
}

/// Projectable metric fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    Key,
    Time,
    Value,
    Min,
    Max,
    Count,
    Sum,
    Average,
    InsertTime,
}

impl MetricField {
    pub const ALL: [MetricField; 9] = [
        MetricField::Key,
        MetricField::Time,
        MetricField::Value,
        MetricField::Min,
        MetricField::Max,
        MetricField::Count,
        MetricField::Sum,
        MetricField::Average,
        MetricField::InsertTime,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MetricField::Key => "Key",
            MetricField::Time => "Time",
            MetricField::Value => "Value",
            MetricField::Min => "Min",
            MetricField::Max => "Max",
            MetricField::Count => "Count",
            MetricField::Sum => "Sum",
            MetricField::Average => "Average",
            MetricField::InsertTime => "InsertTime",
        }
    }

    pub fn parse(name: &str) -> Option<MetricField> {
        Self::ALL.into_iter().find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

// ---------------------------------------------------------------------------
// Shard
// ---------------------------------------------------------------------------

/// Metric aggregate shard.
#[derive(Clone)]
pub struct MetricDb {
    env: PlanBEnv,
    config: Config,
    settings: MetricSettings,
    schema: SchemaInfo,
    table: Table,
    key_codec: ValCodec,
    time_codec: TimeCodec,
    pool: BufferPool,
}

impl MetricDb {
    /// Open or create the shard in `path`.
    pub fn open(path: &Path, name: &str, settings: MetricSettings, config: &Config) -> PlanBResult<Self> {
        let env = PlanBEnv::open(path, name, config)?;
        Self::attach(env, settings, config)
    }

    /// Build the shard over an already open environment, checking (or, for
    /// a new writable environment, storing) its schema.
    pub fn attach(env: PlanBEnv, settings: MetricSettings, config: &Config) -> PlanBResult<Self> {
        let schema = SchemaInfo::new(&settings.key_schema, &settings.value_schema)?;
        schema.ensure(&env)?;

        let key = settings.key_schema;
        let table = env.open_table("metric")?;
        let key_codec = key.key_type.codec(
            &env,
            "metric_key_lookup",
            key.hash_length,
            Some(MAX_KEY_LENGTH - TimeCodec::SIZE),
        )?;
        debug!(store = %env.name(), ?settings, "Opened metric shard");

        Ok(Self {
            env,
            config: config.clone(),
            settings,
            schema,
            table,
            key_codec,
            time_codec: TimeCodec::new(key.temporal_resolution),
            pool: BufferPool::new(),
        })
    }

    /// Share `pool` for encode buffers instead of the shard's own.
    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn settings(&self) -> &MetricSettings {
        &self.settings
    }

    pub fn close(self) -> PlanBResult<()> {
        self.env.close()
    }

    fn width(&self) -> UnsignedBytes {
        self.settings.value_schema.value_width
    }

    /// Create or fold the row for (`subject`, bucket of `time`).
    ///
    /// The folded row keeps the newer of the two insert times, and `latest`
    /// comes from whichever side was inserted more recently.
    fn upsert(
        &self,
        txn: &mut RwTxn<'_>,
        subject: &Val,
        time: i64,
        incoming: &MetricValue,
        insert_time: i64,
    ) -> PlanBResult<()> {
        let width = self.width();
        self.pool.with_buffer(64, |key| {
            self.key_codec.write(txn, subject, |bytes| {
                key.extend_from_slice(bytes);
                Ok(())
            })?;
            self.time_codec.put(key, time)?;

            let (stored_at, merged) = match self.table.get(txn, key)? {
                Some(existing) => {
                    let (existing_at, current) = self.decode_value(existing)?;
                    let merged = if insert_time >= existing_at {
                        current.combine(incoming)?
                    } else {
                        incoming.combine(&current)?
                    };
                    (existing_at.max(insert_time), merged)
                }
                None => (insert_time, *incoming),
            };

            self.pool.with_buffer(8 + 3 * width.width() + 16, |value| {
                rows::put_millis(value, stored_at);
                merged.write(value, width)?;
                Ok(self.table.put(txn, key, value)?)
            })
        })
    }

    /// Split a row key into (encoded subject, encoded bucket time).
    fn split_key(key: &[u8]) -> PlanBResult<(&[u8], &[u8])> {
        let at = key.len().checked_sub(TimeCodec::SIZE).ok_or_else(|| {
            PlanBError::corrupt(COMPONENT, format!("key of {} bytes", key.len()))
        })?;
        Ok(key.split_at(at))
    }

    fn decode_key(&self, txn: &RoTxn<'_>, key: &[u8]) -> PlanBResult<(Val, i64)> {
        let (subject, time) = Self::split_key(key)?;
        Ok((self.key_codec.read(txn, subject)?, self.time_codec.get(time)?))
    }

    fn decode_value(&self, value: &[u8]) -> PlanBResult<(i64, MetricValue)> {
        let insert_time = rows::read_millis(value, 0, COMPONENT)?;
        let (_, aggregate) = rows::split(value, 8, COMPONENT)?;
        Ok((insert_time, MetricValue::read(aggregate, self.width())?))
    }

    fn extract(
        &self,
        txn: &RoTxn<'_>,
        fields: &[Option<MetricField>],
        key: &[u8],
        value: &[u8],
    ) -> PlanBResult<Vec<Val>> {
        let (subject, time) = self.decode_key(txn, key)?;
        let (insert_time, aggregate) = self.decode_value(value)?;
        Ok(fields
            .iter()
            .map(|field| match field {
                Some(MetricField::Key) => subject.clone(),
                Some(MetricField::Time) => Val::Date(time),
                Some(MetricField::Value) => unsigned_val(aggregate.latest),
                Some(MetricField::Min) => unsigned_val(aggregate.min),
                Some(MetricField::Max) => unsigned_val(aggregate.max),
                Some(MetricField::Count) => unsigned_val(aggregate.count),
                Some(MetricField::Sum) => unsigned_val(aggregate.sum),
                Some(MetricField::Average) => Val::Double(aggregate.average()),
                Some(MetricField::InsertTime) => Val::Date(insert_time),
                None => Val::Null,
            })
            .collect())
    }
}

impl Db for MetricDb {
    type Key = MetricKey;
    type Value = MetricValue;

    fn name(&self) -> &str {
        self.env.name()
    }

    fn env(&self) -> &PlanBEnv {
        &self.env
    }

    fn schema_info(&self) -> &SchemaInfo {
        &self.schema
    }

    fn insert(&self, writer: &mut Writer<'_>, key: &MetricKey, value: &MetricValue) -> PlanBResult<()> {
        self.upsert(writer.txn()?, &key.subject, key.time, value, now_millis())
    }

    fn get(&self, key: &MetricKey) -> PlanBResult<Option<MetricValue>> {
        let bucket_key = |subject: &[u8]| -> PlanBResult<Vec<u8>> {
            let mut key_bytes = Vec::with_capacity(subject.len() + TimeCodec::SIZE);
            key_bytes.extend_from_slice(subject);
            self.time_codec.put(&mut key_bytes, key.time)?;
            Ok(key_bytes)
        };
        self.env.read(|txn| {
            self.key_codec.to_lookup(txn, &key.subject, |subject| {
                let Some(subject) = subject else { return Ok(None) };
                match self.table.get(txn, &bucket_key(subject)?)? {
                    Some(value) => Ok(Some(self.decode_value(value)?.1)),
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
        let columns: Vec<Option<MetricField>> = fields.fields().iter().map(|f| MetricField::parse(f)).collect();
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
            let source = MetricDb::attach(source_env.clone(), target.settings, &target.config)?;
            let dest = target.clone();
            target.env.write(move |w| {
                let mut rows = 0u64;
                source.env.read(|stxn| {
                    for entry in source.table.iter(stxn)? {
                        let (key, value) = entry?;
                        let (subject, time) = source.decode_key(stxn, key)?;
                        let (insert_time, aggregate) = source.decode_value(value)?;
                        dest.upsert(w.txn()?, &subject, time, &aggregate, insert_time)?;
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
        let stats = self.env.write(move |w| {
            let mut used = UsedLookups::for_codecs(&shard.key_codec, None);
            db::delete_old_rows(
                w,
                shard.table,
                before,
                &interrupt,
                &mut used,
                |key, value| {
                    if use_insert_time {
                        rows::read_millis(value, 0, COMPONENT)
                    } else {
                        shard.time_codec.get(MetricDb::split_key(key)?.1)
                    }
                },
                |used, key, _| {
                    used.record_key(MetricDb::split_key(key)?.0);
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

impl std::fmt::Debug for MetricDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricDb")
            .field("name", &self.env.name())
            .field("settings", &self.settings)
            .finish()
    }
}
