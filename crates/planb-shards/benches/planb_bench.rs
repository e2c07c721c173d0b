//! Shard write and read throughput.

use chrono::{TimeZone, Utc};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tempfile::TempDir;

use planb_core::{Config, Db, FieldType, Val};
use planb_shards::{MetricDb, MetricKey, MetricSettings, MetricValue, TopicDb, TopicMessage, TopicSettings};

const BATCH: u64 = 1_000;

fn metric_inserts(c: &mut Criterion) {
    let mut group = c.benchmark_group("metric");
    group.throughput(Throughput::Elements(BATCH));

    for key_type in [FieldType::String, FieldType::HashLookup] {
        let dir = TempDir::new().unwrap();
        let settings = MetricSettings::default().with_key_type(key_type);
        let db = MetricDb::open(&dir.path().join("bench"), "bench", settings, &Config::workstation()).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().timestamp_millis();

        group.bench_function(format!("insert_{key_type:?}"), |b| {
            b.iter_batched(
                || {
                    (0..BATCH)
                        .map(|_| {
                            let subject = format!("host-{}", rng.gen_range(0..10_000));
                            let time = base + rng.gen_range(0..86_400_000);
                            (MetricKey::at_millis(subject, time), MetricValue::single(rng.gen_range(0..1_000)))
                        })
                        .collect::<Vec<_>>()
                },
                |events| {
                    for (key, value) in events {
                        db.insert_async(key, value).unwrap();
                    }
                    db.env().writer().unwrap().commit_sync().unwrap();
                },
                BatchSize::SmallInput,
            )
        });

        group.bench_function(format!("get_{key_type:?}"), |b| {
            b.iter(|| {
                let subject = format!("host-{}", rng.gen_range(0..10_000));
                db.get(&MetricKey::at_millis(subject, base)).unwrap()
            })
        });
    }
    group.finish();
}

fn topic_appends(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic");
    group.throughput(Throughput::Elements(BATCH));

    let dir = TempDir::new().unwrap();
    let db = TopicDb::open(&dir.path().join("bench"), "bench", TopicSettings::default(), &Config::workstation()).unwrap();
    let now = Utc::now();

    group.bench_function("append", |b| {
        b.iter(|| {
            for i in 0..BATCH {
                let topic = Val::string(format!("topic-{}", i % 16));
                db.insert_async(topic, TopicMessage::new(now, format!("message {i}"))).unwrap();
            }
            db.env().writer().unwrap().commit_sync().unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, metric_inserts, topic_appends);
criterion_main!(benches);
