//! Host Abstraction
//!
//! A host owns everything one scheduling domain needs: the run queue, the
//! wakeup queue, the worker pool, and one freelist per pooled object type.
//!
//! Lock order: the run-queue mutex may be held while taking the wakeup-queue
//! spinlock, and a port lock may be held while taking the wakeup-queue
//! spinlock. A port lock is never held while taking the run-queue mutex;
//! senders hand woken threads over through the wakeup queue instead.
//!
//! The host counts live schobs. When the last one retires, shutdown is
//! requested and every worker leaves its loop, which returns from
//! [`Host::run`].

use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, error, info, trace, warn};

use crate::config::{HostConfig, MAX_WORKERS};
use crate::error::{KernError, KernResult};
use crate::ipc::{Port, PortType};
use crate::kern::counters::{HostCounters, HostStats};
use crate::kern::dpc::{DpcAttrs, DpcNode};
use crate::kern::freelist::{Freelist, FreelistAttrs, FreelistSnapshot};
use crate::kern::runq::RunQueue;
use crate::kern::schob::{Schob, SchobBody, SchobId, SchobState};
use crate::kern::thread::{BoxedFn, ThreadAttrs, ThreadHandle, ThreadNode, ThreadNodeOps};
use crate::kern::worker::{self, Worker, WorkerRecord};

/// Host identifiers, unique per process
static NEXT_HOST_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Shared Host State
// ============================================================================

/// State guarded by the run-queue mutex
struct RunState {
    queue: RunQueue<Schob>,
    /// Workers leave their loop once this is set
    shutdown: bool,
    /// Between the start and the end of `Host::run`
    running: bool,
}

pub(crate) struct HostShared {
    id: u64,
    config: HostConfig,
    runq: Mutex<RunState>,
    runq_cond: Condvar,
    /// Threads made ready under a port lock, on their way to the run queue
    wakeupq: spin::Mutex<VecDeque<Schob>>,
    schob_count: AtomicUsize,
    next_schob: AtomicU64,
    workers: spin::Mutex<heapless::Vec<Box<WorkerRecord>, MAX_WORKERS>>,
    thd_freelist: Freelist<ThreadNode, ThreadNodeOps>,
    dpc_freelist: Freelist<DpcNode>,
    hostthd_freelist: Freelist<WorkerRecord>,
    pub(crate) counters: HostCounters,
}

impl HostShared {
    fn new(config: HostConfig) -> Self {
        Self {
            id: NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed),
            runq: Mutex::new(RunState {
                queue: RunQueue::new(),
                shutdown: false,
                running: false,
            }),
            runq_cond: Condvar::new(),
            wakeupq: spin::Mutex::new(VecDeque::new()),
            schob_count: AtomicUsize::new(0),
            next_schob: AtomicU64::new(1),
            workers: spin::Mutex::new(heapless::Vec::new()),
            thd_freelist: Freelist::new(
                FreelistAttrs {
                    max_count: config.thread_pool,
                },
                ThreadNodeOps,
            ),
            dpc_freelist: Freelist::simple(config.dpc_pool),
            hostthd_freelist: Freelist::simple(config.worker_pool),
            counters: HostCounters::new(),
            config,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn lock_runq(&self) -> MutexGuard<'_, RunState> {
        self.runq.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> SchobId {
        SchobId(self.next_schob.fetch_add(1, Ordering::Relaxed))
    }

    // ------------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------------

    pub(crate) fn spawn_thread(&self, entry: BoxedFn, attrs: ThreadAttrs) -> KernResult<SchobId> {
        attrs.validate()?;
        let mut node = self.thd_freelist.alloc()?;
        if let Err(err) = node.prepare_stack(attrs.stack_size) {
            self.thd_freelist.free(node);
            return Err(err);
        }

        let id = self.next_id();
        let mut handle = ThreadHandle::from_box(node);
        if let Err(err) = handle.launch(id, entry) {
            self.thd_freelist.free(handle.into_box());
            return Err(err);
        }

        self.counters.threads_created.inc();
        trace!(
            "host {}: created thread {id} (prio {:#x}, stack {})",
            self.id,
            attrs.prio,
            handle.node_mut().stack_len()
        );
        self.admit(Schob::new(id, attrs.prio, SchobBody::Thread(handle)));
        Ok(id)
    }

    pub(crate) fn spawn_dpc(&self, func: BoxedFn, attrs: DpcAttrs) -> KernResult<SchobId> {
        let mut node = self.dpc_freelist.alloc()?;
        node.func = Some(func);

        let id = self.next_id();
        self.counters.dpcs_created.inc();
        trace!("host {}: created DPC {id} (prio {:#x})", self.id, attrs.prio);
        self.admit(Schob::new(id, attrs.prio, SchobBody::Dpc(node)));
        Ok(id)
    }

    /// Count a new schob and make it runnable
    fn admit(&self, schob: Schob) {
        self.schob_count.fetch_add(1, Ordering::AcqRel);
        self.enqueue(schob);
    }

    // ------------------------------------------------------------------------
    // Run Queue
    // ------------------------------------------------------------------------

    /// Put a ready schob on the run queue and wake one idle worker
    pub(crate) fn enqueue(&self, schob: Schob) {
        debug_assert_eq!(schob.state(), SchobState::Ready);
        self.lock_runq().queue.enqueue(schob);
        self.runq_cond.notify_one();
    }

    /// Stage a woken schob; may be called under a port lock
    pub(crate) fn wakeup(&self, schob: Schob) {
        debug_assert_eq!(schob.state(), SchobState::Ready);
        self.wakeupq.lock().push_back(schob);
    }

    /// Move staged schobs onto the run queue
    pub(crate) fn flush_wakeups(&self) {
        let moved = {
            let mut rs = self.lock_runq();
            let woken = core::mem::take(&mut *self.wakeupq.lock());
            let n = woken.len();
            rs.queue.extend(woken);
            n
        };
        match moved {
            0 => {}
            1 => self.runq_cond.notify_one(),
            _ => self.runq_cond.notify_all(),
        }
    }

    /// Block until a schob is ready or shutdown is requested
    pub(crate) fn select(&self) -> Option<Schob> {
        let mut rs = self.lock_runq();
        loop {
            if rs.shutdown {
                return None;
            }
            let woken = core::mem::take(&mut *self.wakeupq.lock());
            rs.queue.extend(woken);
            if let Some(schob) = rs.queue.dequeue() {
                return Some(schob);
            }
            rs = self
                .runq_cond
                .wait(rs)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Reclaim a finished schob into its freelist
    pub(crate) fn retire(&self, mut schob: Schob) {
        schob.set_state(SchobState::Zombie);
        let id = schob.id();
        match schob.body {
            SchobBody::Thread(handle) => self.thd_freelist.free(handle.into_box()),
            SchobBody::Dpc(node) => self.dpc_freelist.free(node),
        }
        self.counters.schobs_retired.inc();

        let remaining = self.schob_count.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!("host {}: retired {id}, {remaining} left", self.id);
        if remaining == 0 {
            debug!("host {}: last schob retired", self.id);
            self.request_shutdown();
        }
    }

    pub(crate) fn request_shutdown(&self) {
        self.lock_runq().shutdown = true;
        self.runq_cond.notify_all();
    }

    // ------------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------------

    fn spawn_workers(self: &Arc<Self>, count: usize) -> KernResult<()> {
        for index in 0..count {
            let mut record = self.hostthd_freelist.alloc()?;
            let shared = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name(format!("nk-worker-{index}"))
                .stack_size(self.config.worker_stack_size)
                .spawn(move || Worker::run(shared, index));
            match spawned {
                Ok(handle) => {
                    record.index = index;
                    record.handle = Some(handle);
                }
                Err(err) => {
                    error!("host {}: cannot spawn worker {index}: {err}", self.id);
                    self.hostthd_freelist.free(record);
                    return Err(KernError::SpawnFailed);
                }
            }
            let pushed = self.workers.lock().push(record);
            if let Err(record) = pushed {
                // The new worker is already live; it only leaves on shutdown
                self.request_shutdown();
                self.reap_worker(record);
                return Err(KernError::InvalidWorkerCount(count));
            }
        }
        Ok(())
    }

    /// Wait for every worker to leave, recycling the records
    fn join_workers(&self) {
        let records = core::mem::take(&mut *self.workers.lock());
        for record in records {
            self.reap_worker(record);
        }
    }

    fn reap_worker(&self, mut record: Box<WorkerRecord>) {
        if let Some(handle) = record.handle.take() {
            if handle.join().is_err() {
                error!("host {}: worker {} panicked", self.id, record.index);
            }
        }
        self.hostthd_freelist.free(record);
    }
}

// ============================================================================
// Host
// ============================================================================

/// Pool statistics, one entry per freelist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub threads: FreelistSnapshot,
    pub dpcs: FreelistSnapshot,
    pub workers: FreelistSnapshot,
}

/// Handle to a scheduling domain
///
/// Cloning is cheap; every clone refers to the same host.
#[derive(Clone)]
pub struct Host {
    shared: Arc<HostShared>,
}

impl Host {
    /// Create a host with the default configuration
    pub fn new() -> KernResult<Self> {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> KernResult<Self> {
        let shared = Arc::new(HostShared::new(config));
        debug!("host {} created", shared.id);
        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &HostShared {
        &self.shared
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Create a thread; callable from anywhere, before or during `run`
    pub fn create_thread_ext<F>(&self, entry: F, attrs: ThreadAttrs) -> KernResult<SchobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn_thread(Box::new(entry), attrs)
    }

    /// Create a DPC; callable from anywhere, before or during `run`
    pub fn create_dpc_ext<F>(&self, func: F, attrs: DpcAttrs) -> KernResult<SchobId>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn_dpc(Box::new(func), attrs)
    }

    /// Create a port bound to this host
    pub fn port_create(&self, kind: PortType) -> Arc<Port> {
        let port = Arc::new(Port::new(self.shared.id, kind));
        trace!("host {}: created {} ({kind})", self.shared.id, port.id());
        port
    }

    /// Run `main` as a DPC on `workers` OS threads until no schob is left
    /// or [`Host::shutdown`] is called
    pub fn run<F>(&self, workers: usize, main: F) -> KernResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if workers == 0 || workers > MAX_WORKERS {
            return Err(KernError::InvalidWorkerCount(workers));
        }
        {
            let mut rs = self.shared.lock_runq();
            if rs.running {
                return Err(KernError::HostRunning);
            }
            rs.running = true;
            rs.shutdown = false;
        }
        info!("host {}: running with {workers} worker(s)", self.shared.id);

        let result = self
            .create_dpc_ext(main, DpcAttrs::default())
            .and_then(|_| self.shared.spawn_workers(workers));
        if let Err(err) = &result {
            warn!("host {}: startup failed: {err}", self.shared.id);
            self.shared.request_shutdown();
        }
        self.shared.join_workers();

        self.shared.lock_runq().running = false;
        info!(
            "host {}: stopped with {} schob(s) left",
            self.shared.id,
            self.schob_count()
        );
        self.shared.counters.dump(self.shared.id);
        result
    }

    /// Ask every worker to leave at its next scheduling point
    pub fn shutdown(&self) {
        debug!("host {}: shutdown requested", self.shared.id);
        self.shared.request_shutdown();
    }

    /// Tear the host down, dropping schobs that never finished
    ///
    /// Threads parked on ports belong to those ports and go away with them.
    pub fn destroy(self) -> KernResult<()> {
        let leftovers = {
            let mut rs = self.shared.lock_runq();
            if rs.running {
                return Err(KernError::HostRunning);
            }
            let mut left = rs.queue.drain();
            left.extend(self.shared.wakeupq.lock().drain(..));
            left
        };
        if !leftovers.is_empty() {
            warn!(
                "host {}: discarding {} unfinished schob(s)",
                self.shared.id,
                leftovers.len()
            );
            self.shared
                .schob_count
                .fetch_sub(leftovers.len(), Ordering::AcqRel);
        }
        drop(leftovers);
        info!("host {} destroyed", self.shared.id);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_runq().running
    }

    /// Live schobs: ready, running, or waiting
    pub fn schob_count(&self) -> usize {
        self.shared.schob_count.load(Ordering::Acquire)
    }

    /// Ready schobs, including those still in the wakeup queue
    pub fn runq_len(&self) -> usize {
        let rs = self.shared.lock_runq();
        rs.queue.len() + self.shared.wakeupq.lock().len()
    }

    pub fn stats(&self) -> HostStats {
        self.shared.counters.snapshot()
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            threads: self.shared.thd_freelist.stats(),
            dpcs: self.shared.dpc_freelist.stats(),
            workers: self.shared.hostthd_freelist.stats(),
        }
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.shared.id)
            .field("schobs", &self.schob_count())
            .finish()
    }
}

/// Host of the calling thread or DPC
pub fn current_host() -> Option<Host> {
    worker::current_host().map(Host::from_shared)
}
