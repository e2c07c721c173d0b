//! The write transaction as seen by actions
//!
//! A [`Writer`] lives on the writer thread and is lent to every action the
//! coordinator applies. It opens the LMDB write transaction lazily, counts
//! applied changes and decides when the batch should be committed.
//!
//! # States
//!
//! - **No open transaction**: `txn()` opens one and arms the commit timer.
//! - **Transaction open**: changes accumulate until `commit()` or `abort()`.
//!
//! Hash clash resolution always runs against the open transaction just
//! before it commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use heed::RwTxn;
use tracing::{debug, warn};

use crate::config::Config;
use crate::env::{EnvCore, Table};
use crate::error::{PlanBError, PlanBResult};

/// Commit thresholds taken from [`Config`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct CommitLimits {
    pub(crate) max_uncommitted_actions: usize,
    pub(crate) commit_interval: Duration,
}

impl CommitLimits {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            max_uncommitted_actions: config.max_uncommitted_actions,
            commit_interval: config.commit_interval,
        }
    }
}

/// Counters maintained by the writer thread.
#[derive(Debug, Default)]
pub struct WriterStats {
    commits: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
}

impl WriterStats {
    /// Successful commits that contained at least one change.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Actions that completed without error.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Actions that failed or were aborted along with a failed transaction.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Submissions not yet taken by the writer thread.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }
}

/// Exclusive owner of the environment's write transaction.
pub struct Writer<'e> {
    core: &'e EnvCore,
    txn: Option<RwTxn<'e>>,
    opened_at: Option<Instant>,
    uncommitted: usize,
    limits: CommitLimits,
    waiting: Vec<Sender<PlanBResult<()>>>,
    stats: &'e WriterStats,
}

impl<'e> Writer<'e> {
    pub(crate) fn new(core: &'e EnvCore, limits: CommitLimits, stats: &'e WriterStats) -> Self {
        Self {
            core,
            txn: None,
            opened_at: None,
            uncommitted: 0,
            limits,
            waiting: Vec::new(),
            stats,
        }
    }

    /// Name of the store this writer belongs to.
    pub fn store(&self) -> &str {
        &self.core.name
    }

    pub fn info_table(&self) -> Table {
        self.core.info
    }

    /// The open write transaction, beginning one if necessary.
    pub fn txn(&mut self) -> PlanBResult<&mut RwTxn<'e>> {
        match self.txn {
            Some(ref mut txn) => Ok(txn),
            None => {
                let txn = self.core.env.write_txn()?;
                self.opened_at = Some(Instant::now());
                Ok(self.txn.insert(txn))
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.txn.is_some()
    }

    /// Changes applied since the last commit.
    pub fn uncommitted(&self) -> usize {
        self.uncommitted
    }

    pub fn increment_change_count(&mut self) {
        self.uncommitted += 1;
    }

    /// True when the open transaction has reached the action ceiling or the
    /// commit interval has passed since it was opened.
    pub fn should_commit(&self) -> bool {
        if self.txn.is_none() {
            return false;
        }
        self.uncommitted >= self.limits.max_uncommitted_actions
            || self
                .opened_at
                .map_or(false, |t| t.elapsed() >= self.limits.commit_interval)
    }

    /// Commit if a threshold has been reached. Returns whether it committed.
    pub fn try_commit(&mut self) -> PlanBResult<bool> {
        if self.should_commit() {
            self.commit()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolve hash clashes and commit the open transaction, if any.
    ///
    /// Every submission waiting on this transaction is released with the
    /// outcome. On failure the transaction is gone and the next `txn()`
    /// starts a fresh one.
    pub fn commit(&mut self) -> PlanBResult<()> {
        let Some(mut txn) = self.txn.take() else {
            self.uncommitted = 0;
            self.release(Ok(()));
            return Ok(());
        };
        self.opened_at = None;
        let changes = std::mem::take(&mut self.uncommitted);

        if let Err(e) = self.core.ledger.resolve(&mut txn, self.core.info) {
            txn.abort();
            self.core.ledger.discard();
            self.release(Err(e.clone()));
            return Err(e);
        }

        if let Err(e) = txn.commit() {
            let e = PlanBError::CommitFailed { reason: e.to_string() };
            warn!(store = %self.core.name, changes, error = %e, "Commit failed");
            self.release(Err(e.clone()));
            return Err(e);
        }

        self.stats.record_commit();
        debug!(store = %self.core.name, changes, "Committed");
        self.release(Ok(()));
        Ok(())
    }

    /// Throw away the open transaction after `cause` and fail every
    /// submission that was waiting on it.
    pub fn abort(&mut self, cause: &PlanBError) {
        if let Some(txn) = self.txn.take() {
            txn.abort();
        }
        self.core.ledger.discard();
        self.opened_at = None;
        self.uncommitted = 0;
        self.release(Err(PlanBError::TransactionAborted { reason: cause.to_string() }));
    }

    /// When the commit timer of the open transaction fires.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match (&self.txn, self.opened_at) {
            (Some(_), Some(opened)) => Some(opened + self.limits.commit_interval),
            _ => None,
        }
    }

    /// Notify `completion` once the current transaction commits, or right
    /// away when nothing is pending.
    pub(crate) fn await_commit(&mut self, completion: Sender<PlanBResult<()>>) {
        if self.txn.is_some() {
            self.waiting.push(completion);
        } else {
            let _ = completion.send(Ok(()));
        }
    }

    fn release(&mut self, outcome: PlanBResult<()>) {
        if outcome.is_err() {
            self.stats.record_failed(self.waiting.len() as u64);
        }
        for waiter in self.waiting.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}
