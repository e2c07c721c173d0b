//! LMDB environment wrapper
//!
//! One [`PlanBEnv`] owns one directory. It holds the `heed` environment, the
//! `info` database (schema descriptor, hash clash total, uid counters) and,
//! when opened read-write, the [`CommitCoordinator`] that owns the only
//! write transaction.
//!
//! # Threads
//!
//! Any thread may call [`PlanBEnv::read`]; each call runs in its own read
//! snapshot. Mutation only happens inside closures passed to
//! [`PlanBEnv::write`] or the coordinator's submission methods, which run on
//! the writer thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use heed::types::Bytes;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use tracing::{debug, info};

use crate::config::Config;
use crate::coordinator::CommitCoordinator;
use crate::error::{PlanBError, PlanBResult};
use crate::lookup::{self, ClashLedger};
use crate::writer::Writer;

/// Untyped LMDB database. Every table in PlanB stores raw bytes; typing is
/// done by the codecs.
pub type Table = Database<Bytes, Bytes>;

const INFO_DB: &str = "info";

/// State shared between env handles and the writer thread.
pub(crate) struct EnvCore {
    pub(crate) env: Env,
    pub(crate) info: Table,
    pub(crate) ledger: Arc<ClashLedger>,
    pub(crate) path: PathBuf,
    pub(crate) name: String,
}

/// Handle to an open environment. Cloning is cheap; all clones share the
/// same engine and writer.
#[derive(Clone)]
pub struct PlanBEnv {
    core: Arc<EnvCore>,
    writer: Option<Arc<CommitCoordinator>>,
}

impl PlanBEnv {
    /// Open or create a read-write environment at `path` and start its writer.
    pub fn open(path: &Path, name: &str, config: &Config) -> PlanBResult<Self> {
        config.checked()?;
        std::fs::create_dir_all(path).map_err(|e| PlanBError::from(e).with_path(path))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(config.max_store_size_bytes)
                .max_readers(config.max_readers)
                .max_dbs(config.max_dbs)
                .open(path)?
        };

        let info = {
            let mut txn = env.write_txn()?;
            let info: Table = env.create_database(&mut txn, Some(INFO_DB))?;
            txn.commit()?;
            info
        };

        let core = Arc::new(EnvCore {
            env,
            info,
            ledger: Arc::new(ClashLedger::default()),
            path: path.to_path_buf(),
            name: name.to_string(),
        });
        let writer = CommitCoordinator::start(Arc::clone(&core), config)?;

        info!(store = %name, path = %path.display(), "Opened environment");
        Ok(Self { core, writer: Some(Arc::new(writer)) })
    }

    /// Open an existing environment without a writer. Used for merge sources.
    pub fn open_read_only(path: &Path, name: &str, config: &Config) -> PlanBResult<Self> {
        config.checked()?;
        if !path.is_dir() {
            return Err(PlanBError::MissingDatabase {
                name: INFO_DB.into(),
                path: path.to_path_buf(),
            });
        }

        let env = unsafe {
            let mut options = EnvOpenOptions::new();
            options
                .map_size(config.max_store_size_bytes)
                .max_readers(config.max_readers)
                .max_dbs(config.max_dbs)
                .flags(EnvFlags::READ_ONLY);
            options.open(path)?
        };

        let info = {
            let txn = env.read_txn()?;
            let info: Option<Table> = env.open_database(&txn, Some(INFO_DB))?;
            txn.commit()?;
            info.ok_or_else(|| PlanBError::MissingDatabase {
                name: INFO_DB.into(),
                path: path.to_path_buf(),
            })?
        };

        debug!(store = %name, path = %path.display(), "Opened environment read-only");
        Ok(Self {
            core: Arc::new(EnvCore {
                env,
                info,
                ledger: Arc::new(ClashLedger::default()),
                path: path.to_path_buf(),
                name: name.to_string(),
            }),
            writer: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn path(&self) -> &Path {
        &self.core.path
    }

    pub fn is_read_only(&self) -> bool {
        self.writer.is_none()
    }

    /// Run `f` inside a fresh read snapshot.
    pub fn read<R>(&self, f: impl FnOnce(&RoTxn<'_>) -> PlanBResult<R>) -> PlanBResult<R> {
        let txn = self.core.env.read_txn()?;
        f(&txn)
    }

    /// Run `f` on the writer thread and wait for it to be committed.
    ///
    /// Calling this from inside another write closure fails rather than
    /// deadlocking the writer.
    pub fn write<R, F>(&self, f: F) -> PlanBResult<R>
    where
        F: FnOnce(&mut Writer<'_>) -> PlanBResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.writer()?.execute(f)
    }

    /// The commit coordinator, for callers that want to batch submissions.
    pub fn writer(&self) -> PlanBResult<&CommitCoordinator> {
        self.writer.as_deref().ok_or_else(|| PlanBError::ReadOnly {
            path: self.core.path.clone(),
        })
    }

    /// Open the named table, creating it when the environment is writable.
    pub fn open_table(&self, name: &str) -> PlanBResult<Table> {
        if self.is_read_only() {
            // Handles opened in a read transaction only survive if it commits.
            let txn = self.core.env.read_txn()?;
            let table = self.core.env.open_database::<Bytes, Bytes>(&txn, Some(name))?;
            txn.commit()?;
            return table.ok_or_else(|| PlanBError::MissingDatabase {
                name: name.to_string(),
                path: self.core.path.clone(),
            });
        }

        let core = Arc::clone(&self.core);
        let name = name.to_string();
        self.write(move |w| {
            let txn = w.txn()?;
            Ok(core.env.create_database::<Bytes, Bytes>(txn, Some(&name))?)
        })
    }

    pub fn info_table(&self) -> Table {
        self.core.info
    }

    pub(crate) fn clash_ledger(&self) -> Arc<ClashLedger> {
        Arc::clone(&self.core.ledger)
    }

    /// Total hash clashes recorded across all hash lookups in this environment.
    pub fn hash_clash_count(&self) -> PlanBResult<u64> {
        self.read(|txn| lookup::read_count(txn, self.core.info))
    }

    /// Bytes currently used by the data file.
    pub fn size_on_disk(&self) -> PlanBResult<u64> {
        Ok(self.core.env.real_disk_size()?)
    }

    /// Drain and stop the writer, then close the engine once no other
    /// handle shares it.
    pub fn close(self) -> PlanBResult<()> {
        if let Some(writer) = &self.writer {
            writer.shutdown();
        }
        let Self { core, writer } = self;
        drop(writer);
        match Arc::try_unwrap(core) {
            Ok(core) => {
                let name = core.name;
                core.env.prepare_for_closing().wait();
                debug!(store = %name, "Closed environment");
            }
            Err(core) => {
                debug!(store = %core.name, handles = Arc::strong_count(&core), "Environment still shared, not closing");
            }
        }
        Ok(())
    }

    /// Remove an environment directory. The environment must be closed.
    pub fn delete(path: &Path) -> PlanBResult<()> {
        match std::fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PlanBError::from(e).with_path(path)),
        }
    }
}

impl std::fmt::Debug for PlanBEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanBEnv")
            .field("name", &self.core.name)
            .field("path", &self.core.path)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_write_read() {
        let dir = TempDir::new().unwrap();
        let env = PlanBEnv::open(dir.path(), "env-test", &Config::budget()).unwrap();
        let table = env.open_table("rows").unwrap();

        env.write(move |w| {
            table.put(w.txn()?, b"k", b"v")?;
            Ok(())
        })
        .unwrap();

        let value = env.read(|txn| Ok(table.get(txn, b"k")?.map(<[u8]>::to_vec))).unwrap();
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
        assert!(env.size_on_disk().unwrap() > 0);
        env.close().unwrap();
    }

    #[test]
    fn test_reopen_keeps_tables() {
        let dir = TempDir::new().unwrap();
        {
            let env = PlanBEnv::open(dir.path(), "env-test", &Config::budget()).unwrap();
            let table = env.open_table("rows").unwrap();
            env.write(move |w| Ok(table.put(w.txn()?, b"a", b"1")?)).unwrap();
            env.close().unwrap();
        }

        let env = PlanBEnv::open_read_only(dir.path(), "env-test", &Config::budget()).unwrap();
        assert!(env.is_read_only());
        let table = env.open_table("rows").unwrap();
        assert_eq!(env.read(|txn| Ok(table.len(txn)?)).unwrap(), 1);

        assert!(matches!(env.open_table("absent"), Err(PlanBError::MissingDatabase { .. })));
        assert!(matches!(env.write(|_| Ok(())), Err(PlanBError::ReadOnly { .. })));
        env.close().unwrap();
    }

    #[test]
    fn test_open_read_only_missing_dir() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = PlanBEnv::open_read_only(&missing, "absent", &Config::budget()).unwrap_err();
        assert!(matches!(err, PlanBError::MissingDatabase { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let config = Config { max_uncommitted_actions: 0, ..Config::budget() };
        let err = PlanBEnv::open(dir.path(), "bad", &config).unwrap_err();
        assert!(matches!(err, PlanBError::InvalidConfig(_)));
    }

    #[test]
    fn test_delete_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shard");
        let env = PlanBEnv::open(&path, "doomed", &Config::budget()).unwrap();
        env.close().unwrap();
        PlanBEnv::delete(&path).unwrap();
        assert!(!path.exists());
        PlanBEnv::delete(&path).unwrap();
    }
}
