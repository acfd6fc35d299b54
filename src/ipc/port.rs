//! Ports
//!
//! A port holds a FIFO of undelivered messages and a FIFO of threads blocked
//! receiving on it. At most one of the two is non-empty at any time: a
//! sender hands its message straight to the oldest waiter if there is one,
//! and a receiver takes the oldest message before it would ever wait.
//!
//! Both queues sit under one spinlock, held only for queue manipulation and
//! never across a run-queue operation. The one exception to "short" is a
//! receiver that finds nothing pending: it keeps the lock while it switches
//! out, and its worker releases it after pushing the thread onto the waiter
//! queue (see [`ParkGuard`]). Receivers therefore wait in the order they
//! found the port empty, and no message can slip past a receiver that is
//! still on its way to the waiter queue.

use core::fmt;
use core::ptr::NonNull;
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace, warn};
use spin::Mutex;

use super::{Message, PortId, PortType};
use crate::error::{KernError, KernResult};
use crate::kern::host::HostShared;
use crate::kern::schob::{Schob, SchobState};

/// Handler run (as a DPC) for every message sent to a DPC-style port
pub type DpcHandler = Arc<dyn Fn(Message) + Send + Sync + 'static>;

#[derive(Default)]
struct PortQueues {
    msgs: VecDeque<Message>,
    /// Blocked receivers, oldest first
    waiters: VecDeque<Schob>,
}

pub struct Port {
    id: PortId,
    /// Owning host
    host: u64,
    kind: PortType,
    queues: Mutex<PortQueues>,
    dpc: Mutex<Option<DpcHandler>>,
}

impl Port {
    pub(crate) fn new(host: u64, kind: PortType) -> Self {
        Self {
            id: PortId::next(),
            host,
            kind,
            queues: Mutex::new(PortQueues::default()),
            dpc: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn port_type(&self) -> PortType {
        self.kind
    }

    /// Id of the host the port was created on
    pub fn host_id(&self) -> u64 {
        self.host
    }

    /// Install the handler of a DPC-style port, replacing any previous one
    pub fn set_dpc<F>(&self, handler: F) -> KernResult<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        if self.kind != PortType::Dpc {
            return Err(KernError::WrongPortType(self.kind));
        }
        *self.dpc.lock() = Some(Arc::new(handler));
        Ok(())
    }

    pub(crate) fn dpc_handler(&self) -> Option<DpcHandler> {
        self.dpc.lock().clone()
    }

    /// Messages waiting for a receiver
    pub fn pending(&self) -> usize {
        self.queues.lock().msgs.len()
    }

    /// Threads blocked receiving
    pub fn waiters(&self) -> usize {
        self.queues.lock().waiters.len()
    }

    /// Empty the port, returning how many pending messages were dropped
    ///
    /// Fails with [`KernError::PortBusy`] while threads are blocked on it.
    /// The handler of a DPC-style port is cleared. The port stays usable.
    pub fn destroy(&self) -> KernResult<usize> {
        let dropped = {
            let mut q = self.queues.lock();
            if !q.waiters.is_empty() {
                return Err(KernError::PortBusy(q.waiters.len()));
            }
            core::mem::take(&mut q.msgs)
        };
        self.dpc.lock().take();

        if !dropped.is_empty() {
            warn!("{}: dropping {} pending message(s)", self.id, dropped.len());
        }
        debug!("{} destroyed", self.id);
        Ok(dropped.len())
    }

    // ------------------------------------------------------------------------
    // Thread-style delivery
    // ------------------------------------------------------------------------

    /// Oldest pending message, or the port lock for parking the caller
    ///
    /// The lock inside the returned guard stays held until the guard is
    /// parked or dropped.
    pub(crate) fn take_or_hold(self: &Arc<Self>) -> Result<Message, ParkGuard> {
        let mut q = self.queues.lock();
        if let Some(msg) = q.msgs.pop_front() {
            return Ok(msg);
        }
        let queues = NonNull::from(spin::MutexGuard::leak(q));
        Err(ParkGuard {
            port: Arc::clone(self),
            queues,
        })
    }

    /// Hand `msg` to the oldest waiter, or queue it
    pub(crate) fn deliver(&self, msg: Message, host: &HostShared) {
        let mut q = self.queues.lock();
        let Some(mut waiter) = q.waiters.pop_front() else {
            q.msgs.push_back(msg);
            drop(q);
            host.counters.msgs_queued.inc();
            trace!("{}: queued message", self.id);
            return;
        };

        let Some(thread) = waiter.thread_mut() else {
            unreachable!("{}: DPC {} on waiter queue", self.id, waiter.id());
        };
        thread.node_mut().recv_slot = Some(msg);
        waiter.set_state(SchobState::Ready);
        trace!("{}: handing message to {}", self.id, waiter.id());
        host.wakeup(waiter);
        drop(q);

        host.counters.msgs_handed_off.inc();
        host.flush_wakeups();
    }
}

// ============================================================================
// Park Guard
// ============================================================================

/// Port lock carried from a blocking receiver to its worker
///
/// Created on the receiving thread's stack when the port has nothing
/// pending, handed to the worker through the yield, and consumed there by
/// [`ParkGuard::park`] once the thread is fully switched out. Dropping it
/// unparked just releases the lock.
pub(crate) struct ParkGuard {
    port: Arc<Port>,
    /// Queues of `port`, locked
    queues: NonNull<PortQueues>,
}

impl ParkGuard {
    /// Append the blocked thread to the waiter queue and release the lock
    pub(crate) fn park(self, mut schob: Schob, host: &HostShared) {
        trace!("{}: {} waiting", self.port.id, schob.id());
        schob.set_state(SchobState::Waiting);
        // SAFETY: the lock taken in `take_or_hold` is still held, and `port`
        // keeps the queues alive.
        unsafe { (*self.queues.as_ptr()).waiters.push_back(schob) };
        drop(self);
        host.counters.parks.inc();
    }
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        // SAFETY: this guard owns the lock leaked in `take_or_hold`.
        unsafe { self.port.queues.force_unlock() };
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::Host;

    #[test]
    fn test_port_ids_unique() {
        let host = Host::new().unwrap();
        let a = host.port_create(PortType::Thread);
        let b = host.port_create(PortType::Thread);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.host_id(), host.id());
        assert_eq!(a.port_type(), PortType::Thread);
    }

    #[test]
    fn test_set_dpc_requires_dpc_port() {
        let host = Host::new().unwrap();
        let thread_port = host.port_create(PortType::Thread);
        assert_eq!(
            thread_port.set_dpc(|_| {}),
            Err(KernError::WrongPortType(PortType::Thread))
        );

        let dpc_port = host.port_create(PortType::Dpc);
        assert!(dpc_port.dpc_handler().is_none());
        dpc_port.set_dpc(|_| {}).unwrap();
        assert!(dpc_port.dpc_handler().is_some());

        dpc_port.destroy().unwrap();
        assert!(dpc_port.dpc_handler().is_none());
    }

    #[test]
    fn test_deliver_without_waiter_queues() {
        let host = Host::new().unwrap();
        let port = host.port_create(PortType::Thread);

        for i in 0..3u32 {
            let msg = Message::new(None, port.clone(), Some(Arc::new(i)), None);
            port.deliver(msg, host.shared());
        }
        assert_eq!(port.pending(), 3);
        assert_eq!(port.waiters(), 0);
        assert_eq!(host.stats().msgs_queued, 3);

        let Ok(first) = port.take_or_hold() else {
            panic!("pending message not taken");
        };
        assert_eq!(first.data1_as::<u32>(), Some(&0));
        assert_eq!(port.destroy(), Ok(2));
        assert_eq!(port.pending(), 0);
        assert!(port.take_or_hold().is_err());
    }

    #[test]
    fn test_unparked_guard_releases_lock() {
        let host = Host::new().unwrap();
        let port = host.port_create(PortType::Thread);

        let Err(guard) = port.take_or_hold() else {
            panic!("empty port yielded a message");
        };
        assert!(port.queues.is_locked());
        drop(guard);
        assert!(!port.queues.is_locked());

        // A sender arriving after the guard is gone queues normally
        let msg = Message::new(None, port.clone(), None, None);
        port.deliver(msg, host.shared());
        assert_eq!(port.pending(), 1);
        assert_eq!(port.waiters(), 0);
    }
}
