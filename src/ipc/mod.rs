//! Port-based message passing
//!
//! Ports are host-bound mailboxes. A thread-style port queues messages for
//! threads blocked in [`msg_recv`]; a DPC-style port turns every message into
//! a DPC running the port's handler.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub mod message;
pub mod port;

pub use message::{msg_recv, msg_send, Message, Payload};
pub use port::{DpcHandler, Port};

/// Global port id counter
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique port identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u64);

impl PortId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port#{}", self.0)
    }
}

/// How a port delivers messages, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortType {
    /// Each message spawns a DPC running the port's handler
    Dpc,
    /// Messages queue up for threads calling `msg_recv`
    Thread,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PortType::Dpc => "DPC",
            PortType::Thread => "thread",
        })
    }
}
