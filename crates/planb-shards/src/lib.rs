//! PlanB shard types
//!
//! Concrete [`Db`](planb_core::Db) implementations composed from the
//! `planb-core` primitives.
//!
//! - [`MetricDb`]: per-subject aggregates folded into time buckets of a
//!   configured resolution. Inserting into an existing bucket updates the
//!   aggregate in place.
//! - [`TopicDb`]: append-only message log per topic, ordered by sequence
//!   number.
//! - [`StateDb`]: one value per key, replaced on insert unless the shard
//!   is configured to keep the first value.
//!
//! Every shard are opened over their own LMDB environment, write through
//! that environment's commit coordinator and can be merged into another
//! shard of the same settings, after which the source directory is deleted.

mod rows;

pub mod metric;
pub mod state;
pub mod topic;

pub use metric::{MetricDb, MetricField, MetricKey, MetricKeySchema, MetricSettings, MetricValue, MetricValueSchema};
pub use state::{StateDb, StateField, StateSettings};
pub use topic::{TopicDb, TopicEntry, TopicField, TopicMessage, TopicSettings};
