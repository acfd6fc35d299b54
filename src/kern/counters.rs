//! Host Event Counters
//!
//! Every host keeps a set of relaxed atomic counters for the events the
//! scheduler and the IPC layer go through. They are cheap enough to be always
//! on and are read as a [`HostStats`] snapshot.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Named, atomically updated counter
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Host Counters
// ============================================================================

#[derive(Debug)]
pub(crate) struct HostCounters {
    pub threads_created: Counter,
    pub dpcs_created: Counter,
    pub schobs_retired: Counter,
    /// Switches from a worker onto a thread stack
    pub context_switches: Counter,
    /// Voluntary `yield_now` calls
    pub yields: Counter,
    /// Receivers that had to wait on a port
    pub parks: Counter,
    pub msgs_sent: Counter,
    /// Messages handed straight to a waiting receiver
    pub msgs_handed_off: Counter,
    /// Messages left pending on a port
    pub msgs_queued: Counter,
    /// Messages that spawned a DPC
    pub dpc_deliveries: Counter,
}

impl HostCounters {
    pub const fn new() -> Self {
        Self {
            threads_created: Counter::new("threads_created"),
            dpcs_created: Counter::new("dpcs_created"),
            schobs_retired: Counter::new("schobs_retired"),
            context_switches: Counter::new("context_switches"),
            yields: Counter::new("yields"),
            parks: Counter::new("parks"),
            msgs_sent: Counter::new("msgs_sent"),
            msgs_handed_off: Counter::new("msgs_handed_off"),
            msgs_queued: Counter::new("msgs_queued"),
            dpc_deliveries: Counter::new("dpc_deliveries"),
        }
    }

    pub fn snapshot(&self) -> HostStats {
        HostStats {
            threads_created: self.threads_created.get(),
            dpcs_created: self.dpcs_created.get(),
            schobs_retired: self.schobs_retired.get(),
            context_switches: self.context_switches.get(),
            yields: self.yields.get(),
            parks: self.parks.get(),
            msgs_sent: self.msgs_sent.get(),
            msgs_handed_off: self.msgs_handed_off.get(),
            msgs_queued: self.msgs_queued.get(),
            dpc_deliveries: self.dpc_deliveries.get(),
        }
    }

    fn all(&self) -> [&Counter; 10] {
        [
            &self.threads_created,
            &self.dpcs_created,
            &self.schobs_retired,
            &self.context_switches,
            &self.yields,
            &self.parks,
            &self.msgs_sent,
            &self.msgs_handed_off,
            &self.msgs_queued,
            &self.dpc_deliveries,
        ]
    }

    /// Log every counter at debug level
    pub fn dump(&self, host: u64) {
        for c in self.all() {
            log::debug!("host {host}: {:<16} {}", c.name(), c.get());
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of a host's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStats {
    pub threads_created: u64,
    pub dpcs_created: u64,
    pub schobs_retired: u64,
    pub context_switches: u64,
    pub yields: u64,
    pub parks: u64,
    pub msgs_sent: u64,
    pub msgs_handed_off: u64,
    pub msgs_queued: u64,
    pub dpc_deliveries: u64,
}

impl fmt::Display for HostStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "threads={} dpcs={} retired={} switches={} yields={} parks={} sent={} handoffs={} queued={} dpc_msgs={}",
            self.threads_created,
            self.dpcs_created,
            self.schobs_retired,
            self.context_switches,
            self.yields,
            self.parks,
            self.msgs_sent,
            self.msgs_handed_off,
            self.msgs_queued,
            self.dpc_deliveries,
        )
    }
}
