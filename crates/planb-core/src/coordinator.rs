//! Single-writer commit coordinator
//!
//! All mutation of an environment happens on one named background thread.
//! Callers submit actions (closures over a [`Writer`]) through a channel;
//! the thread applies them in submission order inside a shared write
//! transaction and commits when one of the triggers fires:
//!
//! 1. the action asked for an immediate commit,
//! 2. the number of uncommitted actions reached the configured ceiling,
//! 3. the commit interval passed since the transaction was opened.
//!
//! # Completion
//!
//! Every submission carries a completion channel. It receives `Ok` once the
//! transaction containing the action commits, or the error that stopped it:
//! the action's own error, `TransactionAborted` when another action in the
//! same batch failed, or `ShuttingDown` if it arrived after shutdown began.
//!
//! # Shutdown
//!
//! [`CommitCoordinator::shutdown`] stops accepting work, lets the thread
//! drain everything already queued, commits, and joins the thread. It is
//! idempotent and also runs on drop.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::env::EnvCore;
use crate::error::{PlanBError, PlanBResult};
use crate::writer::{CommitLimits, Writer, WriterStats};

type WriteAction = Box<dyn FnOnce(&mut Writer<'_>) -> PlanBResult<()> + Send>;

enum Command {
    Apply {
        action: WriteAction,
        commit: bool,
        accepted: Option<Sender<()>>,
        completion: Sender<PlanBResult<()>>,
    },
    Shutdown,
}

/// Result of a submission, available once its transaction commits.
#[derive(Debug)]
pub struct CommitHandle {
    store: String,
    rx: Receiver<PlanBResult<()>>,
}

impl CommitHandle {
    /// Block until the submission's transaction committed or failed.
    pub fn wait(self) -> PlanBResult<()> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(PlanBError::WriterClosed { store: self.store }))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning the
    /// handle so the caller can try again.
    pub fn wait_timeout(self, timeout: Duration) -> Result<PlanBResult<()>, CommitHandle> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => {
                Ok(Err(PlanBError::WriterClosed { store: self.store }))
            }
        }
    }

    /// Outcome if already known.
    pub fn try_result(&self) -> Option<PlanBResult<()>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(channel::TryRecvError::Empty) => None,
            Err(channel::TryRecvError::Disconnected) => Some(Err(PlanBError::WriterClosed {
                store: self.store.clone(),
            })),
        }
    }
}

/// Handle to an environment's writer thread.
pub struct CommitCoordinator {
    store: String,
    tx: Sender<Command>,
    shutting_down: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
    stats: Arc<WriterStats>,
    log_interval: Duration,
}

impl CommitCoordinator {
    pub(crate) fn start(core: Arc<EnvCore>, config: &Config) -> PlanBResult<Self> {
        let (tx, rx) = channel::unbounded();
        let stats = Arc::new(WriterStats::default());
        let limits = CommitLimits::from_config(config);
        let store = core.name.clone();

        let worker_stats = Arc::clone(&stats);
        let worker = thread::Builder::new()
            .name(format!("planb-writer-{}", store))
            .spawn(move || writer_loop(core, rx, limits, worker_stats))
            .map_err(|e| PlanBError::Io {
                path: None,
                kind: e.kind(),
                message: format!("Failed to spawn writer thread: {}", e),
            })?;

        Ok(Self {
            store,
            tx,
            shutting_down: AtomicBool::new(false),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            stats,
            log_interval: config.shutdown_log_interval,
        })
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Submit `action` and block until the writer thread has taken it.
    /// The returned handle resolves when it is committed.
    pub fn put_sync<F>(&self, action: F) -> PlanBResult<CommitHandle>
    where
        F: FnOnce(&mut Writer<'_>) -> PlanBResult<()> + Send + 'static,
    {
        let (accepted_tx, accepted_rx) = channel::bounded(1);
        let handle = self.submit(Box::new(action), false, Some(accepted_tx))?;
        accepted_rx.recv().map_err(|_| self.closed())?;
        Ok(handle)
    }

    /// Submit `action` without blocking.
    pub fn put_async<F>(&self, action: F) -> PlanBResult<CommitHandle>
    where
        F: FnOnce(&mut Writer<'_>) -> PlanBResult<()> + Send + 'static,
    {
        self.submit(Box::new(action), false, None)
    }

    /// Commit everything submitted so far and wait for it.
    pub fn commit_sync(&self) -> PlanBResult<()> {
        self.commit_async()?.wait()
    }

    /// Request a commit of everything submitted so far.
    pub fn commit_async(&self) -> PlanBResult<CommitHandle> {
        self.submit(Box::new(|_: &mut Writer<'_>| Ok(())), true, None)
    }

    /// Run `f` on the writer thread, commit, and hand back its result.
    pub(crate) fn execute<R, F>(&self, f: F) -> PlanBResult<R>
    where
        F: FnOnce(&mut Writer<'_>) -> PlanBResult<R> + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.worker_id {
            return Err(PlanBError::InvariantViolation(format!(
                "nested write on the writer thread of '{}'",
                self.store
            )));
        }

        let (result_tx, result_rx) = channel::bounded(1);
        let handle = self.submit(
            Box::new(move |w: &mut Writer<'_>| {
                let value = f(w)?;
                let _ = result_tx.send(value);
                Ok(())
            }),
            true,
            None,
        )?;
        handle.wait()?;
        result_rx.recv().map_err(|_| self.closed())
    }

    fn submit(
        &self,
        action: WriteAction,
        commit: bool,
        accepted: Option<Sender<()>>,
    ) -> PlanBResult<CommitHandle> {
        if self.is_shutting_down() {
            return Err(PlanBError::ShuttingDown { store: self.store.clone() });
        }
        let (completion, rx) = channel::bounded(1);
        self.stats.record_queued();
        let command = Command::Apply { action, commit, accepted, completion };
        if self.tx.send(command).is_err() {
            self.stats.record_dequeued();
            return Err(self.closed());
        }
        Ok(CommitHandle { store: self.store.clone(), rx })
    }

    fn closed(&self) -> PlanBError {
        PlanBError::WriterClosed { store: self.store.clone() }
    }

    /// Stop accepting work, drain the queue, commit and join the writer.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.tx.send(Command::Shutdown);

        if thread::current().id() == self.worker_id {
            warn!(store = %self.store, "Shutdown requested from the writer thread, not waiting");
            return;
        }

        let Some(handle) = self.worker.lock().take() else { return };
        let started = Instant::now();
        let mut last_log = started;
        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(50));
            if last_log.elapsed() >= self.log_interval {
                warn!(
                    store = %self.store,
                    queued = self.stats.queued(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Writer still draining"
                );
                last_log = Instant::now();
            }
        }
        if handle.join().is_err() {
            error!(store = %self.store, "Writer thread panicked");
        }
    }
}

impl Drop for CommitCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCoordinator")
            .field("store", &self.store)
            .field("shutting_down", &self.is_shutting_down())
            .field("stats", &self.stats)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Writer thread
// ---------------------------------------------------------------------------

fn writer_loop(
    core: Arc<EnvCore>,
    rx: Receiver<Command>,
    limits: CommitLimits,
    stats: Arc<WriterStats>,
) {
    let mut writer = Writer::new(&core, limits, &stats);
    debug!(store = %core.name, "Writer started");

    loop {
        let received = match writer.deadline() {
            Some(deadline) => rx.recv_deadline(deadline).map_err(|e| e == RecvTimeoutError::Timeout),
            None => rx.recv().map_err(|_| false),
        };

        let command = match received {
            Ok(command) => command,
            Err(true) => {
                commit_logged(&mut writer);
                continue;
            }
            // Every coordinator handle is gone.
            Err(false) => break,
        };

        match command {
            Command::Apply { action, commit, accepted, completion } => {
                stats.record_dequeued();
                if let Some(accepted) = accepted {
                    let _ = accepted.send(());
                }
                apply(&mut writer, &stats, action, commit, completion);
            }
            Command::Shutdown => {
                // Submissions racing with shutdown are refused, not dropped.
                for straggler in rx.try_iter() {
                    if let Command::Apply { accepted, completion, .. } = straggler {
                        stats.record_dequeued();
                        if let Some(accepted) = accepted {
                            let _ = accepted.send(());
                        }
                        let _ = completion.send(Err(PlanBError::ShuttingDown { store: core.name.clone() }));
                    }
                }
                break;
            }
        }
    }

    commit_logged(&mut writer);
    info!(
        store = %core.name,
        commits = stats.commits(),
        applied = stats.applied(),
        failed = stats.failed(),
        "Writer stopped"
    );
}

fn apply(
    writer: &mut Writer<'_>,
    stats: &WriterStats,
    action: WriteAction,
    commit: bool,
    completion: Sender<PlanBResult<()>>,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| action(writer))).unwrap_or_else(|panic| {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        Err(PlanBError::InvariantViolation(format!("write action panicked: {}", reason)))
    });

    match outcome {
        Ok(()) => {
            stats.record_applied();
            // Only actions that touched the transaction count toward the ceiling.
            if writer.is_open() {
                writer.increment_change_count();
            }
            writer.await_commit(completion);
            if commit || writer.should_commit() {
                commit_logged(writer);
            }
        }
        Err(e) => {
            stats.record_failed(1);
            error!(store = %writer.store(), error = %e, "Write action failed, aborting transaction");
            let _ = completion.send(Err(e.clone()));
            writer.abort(&e);
        }
    }
}

fn commit_logged(writer: &mut Writer<'_>) {
    if let Err(e) = writer.commit() {
        error!(store = %writer.store(), error = %e, "Commit failed, continuing with a new transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{PlanBEnv, Table};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn test_env(max_uncommitted_actions: usize, commit_interval: Duration) -> (PlanBEnv, Table, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            max_uncommitted_actions,
            commit_interval,
            shutdown_log_interval: Duration::from_millis(100),
            ..Config::budget()
        };
        let env = PlanBEnv::open(dir.path(), "coord-test", &config).unwrap();
        let table = env.open_table("rows").unwrap();
        (env, table, dir)
    }

    fn row_count(env: &PlanBEnv, table: Table) -> u64 {
        env.read(|txn| Ok(table.len(txn)?)).unwrap()
    }

    fn put_row(table: Table, key: u32) -> impl FnOnce(&mut Writer<'_>) -> PlanBResult<()> + Send + 'static {
        move |w| Ok(table.put(w.txn()?, &key.to_be_bytes(), b"v")?)
    }

    #[test]
    fn test_count_ceiling_commits() {
        let (env, table, _dir) = test_env(5, Duration::from_secs(3600));
        let writer = env.writer().unwrap();

        let handles: Vec<_> = (0..4).map(|i| writer.put_sync(put_row(table, i)).unwrap()).collect();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(row_count(&env, table), 0);
        assert!(handles[3].try_result().is_none());

        writer.put_sync(put_row(table, 4)).unwrap().wait().unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(row_count(&env, table), 5);
    }

    #[test]
    fn test_ceiling_minus_one_stays_open() {
        let (env, table, _dir) = test_env(3, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        writer.put_sync(put_row(table, 0)).unwrap();
        let second = writer.put_sync(put_row(table, 1)).unwrap();
        let second = second.wait_timeout(Duration::from_millis(200)).unwrap_err();
        assert_eq!(row_count(&env, table), 0);

        writer.put_sync(put_row(table, 2)).unwrap().wait().unwrap();
        second.wait().unwrap();
        assert_eq!(row_count(&env, table), 3);
    }

    #[test]
    fn test_idle_commits_do_not_count_toward_ceiling() {
        let (env, table, _dir) = test_env(5, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        for _ in 0..3 {
            writer.commit_sync().unwrap();
        }
        let commits = writer.stats().commits();
        let applied = writer.stats().applied();

        let first = writer.put_sync(put_row(table, 0)).unwrap();
        writer.put_sync(put_row(table, 1)).unwrap();
        while writer.stats().applied() < applied + 2 {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(writer.stats().commits(), commits);
        assert_eq!(row_count(&env, table), 0);
        assert!(first.try_result().is_none());

        writer.commit_sync().unwrap();
        first.wait().unwrap();
        assert_eq!(row_count(&env, table), 2);
    }

    #[test]
    fn test_put_sync_orders_across_threads() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let tagged = |tag: u8| {
            let seen = Arc::clone(&seen);
            move |w: &mut Writer<'_>| -> PlanBResult<()> {
                seen.lock().push(tag);
                Ok(table.put(w.txn()?, b"key", &[tag])?)
            }
        };

        let (first_taken, wait_first) = channel::bounded::<()>(1);
        thread::scope(|s| {
            s.spawn(|| {
                writer.put_sync(tagged(b'a')).unwrap();
                first_taken.send(()).unwrap();
            });
            s.spawn(|| {
                wait_first.recv().unwrap();
                writer.put_sync(tagged(b'b')).unwrap();
            });
        });
        writer.commit_sync().unwrap();

        assert_eq!(*seen.lock(), vec![b'a', b'b']);
        let value = env.read(|txn| Ok(table.get(txn, b"key")?.map(<[u8]>::to_vec))).unwrap();
        assert_eq!(value, Some(vec![b'b']));
    }

    #[test]
    fn test_timer_commits_idle_batch() {
        let (env, table, _dir) = test_env(1000, Duration::from_millis(100));
        let writer = env.writer().unwrap();
        let handle = writer.put_async(put_row(table, 1)).unwrap();
        let outcome = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.is_ok());
        assert_eq!(row_count(&env, table), 1);
    }

    #[test]
    fn test_commit_sync_flushes() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        for i in 0..10 {
            writer.put_async(put_row(table, i)).unwrap();
        }
        writer.commit_sync().unwrap();
        assert_eq!(row_count(&env, table), 10);
        assert_eq!(writer.stats().commits(), 2);
    }

    #[test]
    fn test_actions_apply_in_submission_order() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100u32 {
            let seen = Arc::clone(&seen);
            writer
                .put_async(move |w| {
                    seen.lock().push(i);
                    Ok(table.put(w.txn()?, b"last", &i.to_be_bytes())?)
                })
                .unwrap();
        }
        writer.commit_sync().unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        let last = env.read(|txn| Ok(table.get(txn, b"last")?.map(<[u8]>::to_vec))).unwrap();
        assert_eq!(last, Some(99u32.to_be_bytes().to_vec()));
    }

    #[test]
    fn test_failed_action_is_isolated() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let writer = env.writer().unwrap();

        let before = writer.put_async(put_row(table, 1)).unwrap();
        let bad = writer
            .put_async(|_| Err(PlanBError::InvariantViolation("bad action".into())))
            .unwrap();
        let after = writer.put_async(put_row(table, 2)).unwrap();
        writer.commit_sync().unwrap();

        assert!(matches!(before.wait(), Err(PlanBError::TransactionAborted { .. })));
        assert!(matches!(bad.wait(), Err(PlanBError::InvariantViolation(_))));
        after.wait().unwrap();

        env.read(|txn| {
            assert!(table.get(txn, &1u32.to_be_bytes())?.is_none());
            assert!(table.get(txn, &2u32.to_be_bytes())?.is_some());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_panicking_action_does_not_wedge_writer() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let writer = env.writer().unwrap();
        let handle = writer.put_async(|_| panic!("boom")).unwrap();
        assert!(matches!(handle.wait(), Err(PlanBError::InvariantViolation(msg)) if msg.contains("boom")));

        env.write(move |w| Ok(table.put(w.txn()?, b"k", b"v")?)).unwrap();
        assert_eq!(row_count(&env, table), 1);
    }

    #[test]
    fn test_write_returns_value() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let n = env
            .write(move |w| {
                table.put(w.txn()?, b"a", b"1")?;
                table.put(w.txn()?, b"b", b"2")?;
                Ok(table.len(w.txn()?)?)
            })
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn test_nested_write_is_rejected() {
        let (env, _table, _dir) = test_env(1000, Duration::from_secs(3600));
        let inner = env.clone();
        let outcome = env.write(move |_| Ok(inner.write(|_| Ok(())))).unwrap();
        assert!(matches!(outcome, Err(PlanBError::InvariantViolation(_))));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let (env, table, _dir) = test_env(1000, Duration::from_secs(3600));
        let applied = Arc::new(AtomicUsize::new(0));
        let writer = env.writer().unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let applied = Arc::clone(&applied);
            handles.push(
                writer
                    .put_async(move |w| {
                        thread::sleep(Duration::from_millis(2));
                        applied.fetch_add(1, Ordering::SeqCst);
                        put_row(table, i)(w)
                    })
                    .unwrap(),
            );
        }
        writer.shutdown();
        writer.shutdown();

        assert_eq!(applied.load(Ordering::SeqCst), 50);
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(row_count(&env, table), 50);
        assert!(matches!(writer.put_async(|_| Ok(())), Err(PlanBError::ShuttingDown { .. })));
        assert!(matches!(writer.commit_sync(), Err(PlanBError::ShuttingDown { .. })));
    }
}
