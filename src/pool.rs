// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The worker pool and claimer: the live worker set, the free list, and
//! the FIFO of suspended claimers, bounded by `max_workers` and the
//! per-group compatibility hash.

use crate::config::DispatcherConfig;
use crate::errors::WorkerSpawnError;
use crate::model::TestGroup;
use crate::worker::WorkerHandle;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tokio::sync::{oneshot, Notify};

/// The outcome of the pool's synchronous try-claim step.
enum Claim {
    Worker(Rc<WorkerHandle>),
    /// The pool has room for one more worker at `index`; the caller must
    /// spawn and initialize it itself, outside any borrow of the pool.
    Spawn(usize),
    /// No worker is available; `rx` resolves once one is.
    Wait(oneshot::Receiver<()>),
}

/// Owns the live worker set, the free list, and the FIFO of suspended
/// claimers.
///
/// Every public method here is synchronous and returns promptly: the
/// critical constraint is that the decision to enqueue a claimer must be
/// made atomically with observing that no worker is free, which in an
/// `Rc<RefCell<_>>` world just means "don't hold the borrow across an
/// `.await`". [`obtain`] is the free function that does the actual
/// suspending, entirely outside of any borrow of this type.
pub struct WorkerPool {
    max_workers: usize,
    next_index: usize,
    /// Every worker that has been spawned and hasn't yet been confirmed
    /// exited, whether idle or running a job.
    live: Vec<Rc<WorkerHandle>>,
    free: Vec<Rc<WorkerHandle>>,
    claimers: VecDeque<oneshot::Sender<()>>,
    /// Notified whenever the live set becomes empty, so `Dispatcher::stop`
    /// can await every worker actually exiting.
    drained: Rc<Notify>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            next_index: 0,
            live: Vec::new(),
            free: Vec::new(),
            claimers: VecDeque::new(),
            drained: Rc::new(Notify::new()),
        }
    }

    pub fn live_worker_count(&self) -> usize {
        self.live.len()
    }

    /// A snapshot of every live worker, for `Dispatcher::stop` to send
    /// `stop()` to each of them.
    pub fn live_workers(&self) -> Vec<Rc<WorkerHandle>> {
        self.live.clone()
    }

    fn try_claim(&mut self) -> Claim {
        if let Some(worker) = self.free.pop() {
            return Claim::Worker(worker);
        }
        if self.live.len() < self.max_workers {
            let index = self.next_index;
            self.next_index += 1;
            return Claim::Spawn(index);
        }
        let (tx, rx) = oneshot::channel();
        self.claimers.push_back(tx);
        Claim::Wait(rx)
    }

    /// Returns a completed worker to the free list and wakes the oldest
    /// suspended claimer, if any.
    pub fn release(&mut self, worker: Rc<WorkerHandle>) {
        self.free.push(worker);
        self.wake_one_claimer();
    }

    /// Records that a discarded worker has actually exited: drops it from
    /// the live set and wakes a claimer so the next requester gets the
    /// chance to spawn a fresh one. Must only be called after the worker's
    /// process has actually exited, see `job::run_job`.
    pub fn forget_exited(&mut self, worker: &Rc<WorkerHandle>) {
        self.live.retain(|w| !Rc::ptr_eq(w, worker));
        self.wake_one_claimer();
        if self.live.is_empty() {
            self.drained.notify_waiters();
        }
    }

    fn wake_one_claimer(&mut self) {
        if let Some(tx) = self.claimers.pop_front() {
            let _ = tx.send(());
        }
    }
}

/// Waits until the pool's live set is empty. Used by `Dispatcher::stop` to
/// await every worker's exit after requesting it.
pub async fn wait_drained(pool: &Rc<RefCell<WorkerPool>>) {
    loop {
        let drained = {
            let pool = pool.borrow();
            if pool.live.is_empty() {
                return;
            }
            pool.drained.clone()
        };
        drained.notified().await;
    }
}

/// Obtains a worker compatible with `group`, spawning and initializing a
/// new one if the pool has headroom, or suspending until one frees up
/// otherwise.
///
/// `spawn` performs the actual process spawn for a fresh worker; production
/// callers pass `WorkerHandle::spawn`, tests pass something that builds a
/// fake handle instead, so the claim/suspend logic here is exercised without
/// ever starting a real child process.
///
/// Does not itself enforce the compatibility hash on a recycled worker: that
/// check, and the re-claim it triggers on mismatch, live in
/// `Dispatcher::run`, the only place where incompatible workers are
/// discarded.
pub async fn obtain(
    pool: &Rc<RefCell<WorkerPool>>,
    config: &DispatcherConfig,
    group: &TestGroup,
    spawn: impl Fn(usize, &DispatcherConfig) -> Result<WorkerHandle, WorkerSpawnError>,
    loader_payload: impl Fn() -> serde_json::Value,
) -> Result<Rc<WorkerHandle>, WorkerSpawnError> {
    loop {
        // Each borrow below is a short, synchronous critical section that
        // never spans an `.await`, see `WorkerPool`'s doc comment.
        let claim = pool.borrow_mut().try_claim();
        match claim {
            Claim::Worker(worker) => return Ok(worker),
            Claim::Spawn(index) => {
                let worker = spawn(index, config)?;
                worker.init(group, loader_payload()).await;
                let worker = Rc::new(worker);
                pool.borrow_mut().live.push(worker.clone());
                return Ok(worker);
            }
            Claim::Wait(rx) => {
                let _ = rx.await;
            }
        }
    }
}
