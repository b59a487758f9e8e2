//! Bounded pool of executor workers
//!
//! The pool is the only shared mutable structure dispatchers touch. All
//! state changes happen in short critical sections; spawning and worker
//! I/O always happen outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ExecutionError;
use crate::worker::{WorkerProcess, WorkerSpec};

/// Resolve the capacity rule: a fixed count when given, otherwise one
/// worker per CPU with a floor of one.
pub fn resolve_capacity(fixed_workers: usize) -> usize {
    if fixed_workers > 0 {
        fixed_workers
    } else {
        std::cmp::max(1, num_cpus::get())
    }
}

/// Pool occupancy counters.
///
/// `live` counts every process the pool is responsible for: idle, leased,
/// and broken workers whose termination is still in flight. The invariant
/// `live <= capacity` holds at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub idle: usize,
    pub leased: usize,
    pub live: usize,
}

#[derive(Debug)]
struct PoolInner {
    idle: VecDeque<WorkerProcess>,
    live: usize,
    leased: usize,
    /// Pid per leased generation, so shutdown can reach workers it no
    /// longer holds.
    leased_pids: HashMap<u64, u32>,
    shutting_down: bool,
    next_generation: u64,
}

struct PoolShared {
    spec: WorkerSpec,
    capacity: usize,
    inner: Mutex<PoolInner>,
    /// Signalled whenever a worker or capacity slot frees up.
    available: Notify,
    /// Signalled whenever `leased` or `live` drops, for shutdown draining.
    drained: Notify,
}

/// Bounded multiset of worker processes with FIFO reuse.
///
/// Cloning is cheap; all clones share the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

enum LeasePlan {
    Take(Box<WorkerProcess>),
    Spawn(u64),
    Wait,
}

impl WorkerPool {
    pub fn new(spec: WorkerSpec, capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                spec,
                capacity,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    live: 0,
                    leased: 0,
                    leased_pids: HashMap::new(),
                    shutting_down: false,
                    next_generation: 0,
                }),
                available: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn counts(&self) -> PoolCounts {
        let inner = self.shared.inner.lock();
        PoolCounts {
            idle: inner.idle.len(),
            leased: inner.leased,
            live: inner.live,
        }
    }

    /// Spawn up to `count` workers eagerly (fixed-size pools).
    pub async fn prespawn(&self, count: usize) -> Result<(), ExecutionError> {
        for _ in 0..count.min(self.shared.capacity) {
            let generation = {
                let mut inner = self.shared.inner.lock();
                if inner.shutting_down || inner.live >= self.shared.capacity {
                    return Ok(());
                }
                inner.live += 1;
                let generation = inner.next_generation;
                inner.next_generation += 1;
                generation
            };
            match WorkerProcess::spawn(&self.shared.spec, generation).await {
                Ok(worker) => {
                    self.shared.inner.lock().idle.push_back(worker);
                    self.shared.available.notify_one();
                }
                Err(e) => {
                    self.free_slot();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Lease an idle worker, spawning one if the pool is below capacity,
    /// otherwise waiting until a worker is released.
    ///
    /// Waiting respects `cancel`: a cancelled lease reserves nothing and
    /// returns [`ExecutionError::Cancelled`]. Once the pool is closed,
    /// leases fail with [`ExecutionError::ShuttingDown`].
    pub async fn lease(&self, cancel: &CancellationToken) -> Result<WorkerProcess, ExecutionError> {
        loop {
            let plan = {
                let mut inner = self.shared.inner.lock();
                if inner.shutting_down {
                    return Err(ExecutionError::ShuttingDown);
                }
                if let Some(worker) = inner.idle.pop_front() {
                    inner.leased += 1;
                    inner.leased_pids.insert(worker.generation(), worker.pid());
                    LeasePlan::Take(Box::new(worker))
                } else if inner.live < self.shared.capacity {
                    inner.live += 1;
                    inner.leased += 1;
                    let generation = inner.next_generation;
                    inner.next_generation += 1;
                    LeasePlan::Spawn(generation)
                } else {
                    LeasePlan::Wait
                }
            };

            match plan {
                LeasePlan::Take(worker) => return Ok(*worker),
                LeasePlan::Spawn(generation) => {
                    match WorkerProcess::spawn(&self.shared.spec, generation).await {
                        Ok(worker) => {
                            self.shared
                                .inner
                                .lock()
                                .leased_pids
                                .insert(worker.generation(), worker.pid());
                            return Ok(worker);
                        }
                        Err(e) => {
                            {
                                let mut inner = self.shared.inner.lock();
                                inner.live -= 1;
                                inner.leased -= 1;
                            }
                            self.shared.available.notify_one();
                            self.shared.drained.notify_waiters();
                            return Err(e);
                        }
                    }
                }
                LeasePlan::Wait => {
                    tokio::select! {
                        _ = self.shared.available.notified() => {}
                        _ = cancel.cancelled() => {
                            // This waiter may have consumed a wakeup permit;
                            // pass it along so no other waiter strands.
                            self.shared.available.notify_one();
                            return Err(ExecutionError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    /// Return a leased worker. Healthy workers rejoin the idle queue in
    /// FIFO order; broken ones are discarded and terminated.
    pub fn release(&self, worker: WorkerProcess) {
        if worker.is_broken() {
            self.recycle(worker);
            return;
        }
        let mut inner = self.shared.inner.lock();
        inner.leased -= 1;
        inner.leased_pids.remove(&worker.generation());
        if inner.shutting_down {
            drop(inner);
            self.shared.drained.notify_waiters();
            self.terminate_detached(worker, false);
            return;
        }
        inner.idle.push_back(worker);
        drop(inner);
        self.shared.available.notify_one();
        self.shared.drained.notify_waiters();
    }

    /// Discard a leased worker: its process is killed asynchronously and
    /// its capacity slot freed once the process is gone. Never blocks the
    /// caller.
    pub fn recycle(&self, worker: WorkerProcess) {
        debug!(worker = %worker.id(), "recycling worker");
        {
            let mut inner = self.shared.inner.lock();
            inner.leased -= 1;
            inner.leased_pids.remove(&worker.generation());
        }
        self.shared.drained.notify_waiters();
        self.terminate_detached(worker, true);
    }

    /// Refuse further leases and wake every waiting lessee. Idempotent;
    /// part of [`WorkerPool::shutdown`], split out so the supervisor can
    /// fail pending leases at the very start of the shutdown sequence.
    pub fn close(&self) {
        let was_open = {
            let mut inner = self.shared.inner.lock();
            let was_open = !inner.shutting_down;
            inner.shutting_down = true;
            was_open
        };
        if was_open {
            self.shared.available.notify_waiters();
        }
    }

    /// Drain and stop the pool: refuse new leases, wait (bounded) for
    /// outstanding leases to come back, then terminate every worker.
    pub async fn shutdown(&self, drain: Duration) {
        self.close();

        // Leased workers get the drain window to finish their exchange.
        let deadline = tokio::time::Instant::now() + drain;
        loop {
            let leased = self.shared.inner.lock().leased;
            if leased == 0 {
                break;
            }
            let notified = self.shared.drained.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(leased, "drain window elapsed with leases outstanding");
                break;
            }
        }

        // Idle workers are asked to exit politely.
        let idle: Vec<WorkerProcess> = {
            let mut inner = self.shared.inner.lock();
            inner.idle.drain(..).collect()
        };
        let mut terminations = tokio::task::JoinSet::new();
        for worker in idle {
            let shared = Arc::clone(&self.shared);
            terminations.spawn(async move {
                worker.shutdown().await;
                shared.inner.lock().live -= 1;
                shared.drained.notify_waiters();
            });
        }
        while terminations.join_next().await.is_some() {}

        // Anything still leased past the drain window is killed outright;
        // its dispatcher observes EOF and recycles.
        #[cfg(unix)]
        {
            let pids: Vec<u32> = self.shared.inner.lock().leased_pids.values().copied().collect();
            for pid in pids {
                warn!(pid, "force-killing worker still leased after drain");
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }

        // Bounded wait for recycle tasks to reap the last processes.
        let deadline = tokio::time::Instant::now() + drain;
        loop {
            let live = self.shared.inner.lock().live;
            if live == 0 {
                break;
            }
            let notified = self.shared.drained.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(live, "pool shutdown finished with workers unreaped");
                break;
            }
        }
        info!("worker pool stopped");
    }

    fn free_slot(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.live -= 1;
        }
        self.shared.available.notify_one();
        self.shared.drained.notify_waiters();
    }

    fn terminate_detached(&self, worker: WorkerProcess, force: bool) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if force {
                worker.kill().await;
            } else {
                worker.shutdown().await;
            }
            {
                let mut inner = shared.inner.lock();
                inner.live -= 1;
            }
            shared.available.notify_one();
            shared.drained.notify_waiters();
        });
    }
}
