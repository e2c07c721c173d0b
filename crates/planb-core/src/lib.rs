//! PlanB Core: embedded single-writer shard storage
//!
//! Transactional key-value storage for write-heavy operational data, built
//! on LMDB's memory-mapped, ordered, single-writer/multi-reader engine.
//!
//! # Architecture
//!
//! - **Read path**: any thread opens a read snapshot and decodes rows
//!   through typed codecs. Readers never block the writer.
//! - **Write path**: every mutation is an action submitted to the
//!   environment's commit coordinator, which applies actions in order on a
//!   single thread and batches them into write transactions.
//! - **Interning**: large or repeated values are stored once in hash or uid
//!   lookup tables and referenced by fixed-width ids. Unreferenced lookup
//!   rows are collected at the end of each retention sweep.
//!
//! Concrete shard types live in `planb-shards`; this crate provides the
//! primitives they are composed from.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod env;
pub mod error;
pub mod lookup;
pub mod platform_durability;
pub mod search;
pub mod value;
pub mod writer;

// Re-export key types for convenience
pub use buffer::{BufferPool, BufferPoolStats};
pub use codec::{FieldType, TemporalResolution, TimeCodec, UnsignedBytes, ValCodec};
pub use config::Config;
pub use coordinator::{CommitCoordinator, CommitHandle};
pub use db::{Db, Interrupt, SchemaInfo, SweepStats};
pub use env::{PlanBEnv, Table};
pub use error::{ErrorCategory, PlanBError, PlanBResult};
pub use lookup::{HashLength, LookupTable, UsedLookups};
pub use search::{Condition, ExpressionCriteria, ExpressionItem, FieldIndex, Predicate};
pub use value::Val;
pub use writer::{Writer, WriterStats};
