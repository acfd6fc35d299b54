//! Workers
//!
//! A worker is an OS thread that runs the scheduling loop of one host. It
//! takes the highest-priority ready schob and either calls it (DPC) or
//! switches onto its stack (thread). When a thread switches back, the yield
//! reason tells the worker what to do with it:
//!
//! - `Ready`: requeue it;
//! - `Waiting`: park it on the port the thread recorded before switching;
//! - `Zombie`: reclaim it.
//!
//! Parking happens here, on the worker's own stack. A blocking receiver
//! switches out still holding its port's lock; the worker pushes it onto the
//! waiter queue and only then releases that lock.
//!
//! A suspended thread may resume on any worker. Code running on a thread
//! stack must therefore never keep a `&Worker` (or anything else derived from
//! thread-local storage) across a switch; it calls [`current_worker`] again.

use core::cell::{Cell, UnsafeCell};
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, error, trace};

use crate::arch::{self, StackPtr, YieldReason};
use crate::error::{KernError, KernResult};
use crate::ipc::port::ParkGuard;
use crate::kern::host::HostShared;
use crate::kern::schob::{Schob, SchobBody, SchobId, SchobState, SchobType};
use crate::kern::thread::ThreadNode;

// ============================================================================
// Worker Record
// ============================================================================

/// Host-side bookkeeping for one worker, pooled in the worker freelist
#[derive(Debug, Default)]
pub(crate) struct WorkerRecord {
    pub(crate) index: usize,
    pub(crate) handle: Option<JoinHandle<()>>,
}

// ============================================================================
// Current Context
// ============================================================================

/// What a worker is running right now
#[derive(Debug, Clone, Copy)]
pub(crate) enum Current {
    /// In the scheduling loop
    Idle,
    Thread {
        id: SchobId,
        node: NonNull<ThreadNode>,
    },
    Dpc {
        id: SchobId,
    },
}

thread_local! {
    static WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// Worker running on this OS thread
///
/// Not inlined: a green thread can move to another OS thread between two
/// calls, so the TLS slot has to be looked up afresh every time.
#[inline(never)]
fn current_worker() -> *const Worker {
    WORKER.with(Cell::get)
}

fn with_worker<R>(f: impl FnOnce(&Worker) -> R) -> Option<R> {
    let worker = current_worker();
    // SAFETY: the slot is set only while `Worker::run` holds the worker on
    // this OS thread's stack, and cleared before it returns.
    unsafe { worker.as_ref() }.map(f)
}

/// Host of the calling thread or DPC
pub(crate) fn current_host() -> Option<Arc<HostShared>> {
    with_worker(|w| Arc::clone(&w.host))
}

/// What the calling worker is running, `None` off-worker
pub(crate) fn current() -> Option<Current> {
    with_worker(|w| w.current.get())
}

/// Identifier and node of the calling thread
pub(crate) fn current_thread() -> KernResult<(SchobId, NonNull<ThreadNode>)> {
    match current().ok_or(KernError::NoContext)? {
        Current::Thread { id, node } => Ok((id, node)),
        Current::Dpc { .. } | Current::Idle => Err(KernError::NotThread),
    }
}

/// Switch the calling thread back to its worker
///
/// `park_on` is handed to the worker when `reason` is `Waiting`; on error it
/// is dropped, which releases its port. Returns once a worker (not
/// necessarily the same one) resumes the thread.
pub(crate) fn suspend(reason: YieldReason, park_on: Option<ParkGuard>) -> KernResult<()> {
    let worker = current_worker();
    if worker.is_null() {
        return Err(KernError::NoContext);
    }
    let (sched_sp, node) = {
        // SAFETY: see `with_worker`; the reference is dropped before the switch.
        let worker = unsafe { &*worker };
        let Current::Thread { node, .. } = worker.current.get() else {
            return Err(KernError::NotThread);
        };
        if reason == YieldReason::Ready {
            worker.host.counters.yields.inc();
        }
        worker.park_on.set(park_on);
        // SAFETY: written by this worker's `switch_ctx` before it switched to us.
        (unsafe { *worker.sched_sp.get() }, node)
    };
    // SAFETY: `node` is the running thread's own node and stays put while it
    // is suspended; `sched_sp` is the suspended scheduling loop.
    unsafe {
        arch::switch_ctx(ptr::addr_of_mut!((*node.as_ptr()).sp), sched_sp, reason);
    }
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

pub(crate) struct Worker {
    host: Arc<HostShared>,
    index: usize,
    /// Scheduling loop stack pointer while a thread runs
    sched_sp: UnsafeCell<StackPtr>,
    current: Cell<Current>,
    /// Locked port a `Waiting` thread wants to be parked on
    park_on: Cell<Option<ParkGuard>>,
}

impl Worker {
    /// Body of a worker OS thread
    pub(crate) fn run(host: Arc<HostShared>, index: usize) {
        let worker = Worker {
            host,
            index,
            sched_sp: UnsafeCell::new(ptr::null_mut()),
            current: Cell::new(Current::Idle),
            park_on: Cell::new(None),
        };
        WORKER.with(|slot| slot.set(&worker));
        debug!("host {}: worker {} started", worker.host.id(), index);

        worker.schedule();

        WORKER.with(|slot| slot.set(ptr::null()));
        debug!("host {}: worker {} exiting", worker.host.id(), index);
    }

    fn schedule(&self) {
        while let Some(mut schob) = self.host.select() {
            schob.dispatch(self.index);
            debug_assert_eq!(schob.hostthd(), Some(self.index));
            trace!(
                "worker {}: running {} (prio {:#x})",
                self.index,
                schob.id(),
                schob.prio()
            );
            match schob.schob_type() {
                SchobType::Dpc => self.run_dpc(schob),
                SchobType::Thread => self.run_thread(schob),
            }
        }
    }

    fn run_dpc(&self, mut schob: Schob) {
        let id = schob.id();
        let func = match &mut schob.body {
            SchobBody::Dpc(node) => node.func.take(),
            SchobBody::Thread(_) => None,
        };
        self.current.set(Current::Dpc { id });
        if let Some(func) = func {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(func)) {
                error!("{id} panicked: {}", super::panic_message(payload.as_ref()));
            }
        }
        self.current.set(Current::Idle);
        self.host.retire(schob);
    }

    fn run_thread(&self, mut schob: Schob) {
        let id = schob.id();
        let Some(node) = schob.thread_mut().map(|t| t.as_ptr()) else {
            return self.host.retire(schob);
        };
        self.current.set(Current::Thread { id, node });
        self.host.counters.context_switches.inc();

        // SAFETY: the thread is suspended (or fresh) and owned by this
        // worker through `schob`, so its saved stack pointer is valid.
        let reason = unsafe {
            let to = (*node.as_ptr()).sp;
            arch::switch_ctx(self.sched_sp.get(), to, YieldReason::Ready)
        };
        self.current.set(Current::Idle);

        match reason {
            YieldReason::Ready => {
                schob.set_state(SchobState::Ready);
                self.host.enqueue(schob);
            }
            YieldReason::Waiting => match self.park_on.take() {
                Some(guard) => guard.park(schob, &self.host),
                None => {
                    error!("{id} blocked without a port, requeueing");
                    schob.set_state(SchobState::Ready);
                    self.host.enqueue(schob);
                }
            },
            YieldReason::Zombie => self.host.retire(schob),
        }
    }
}
