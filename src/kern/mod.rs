//! Kern subsystem - scheduling core
//!
//! Schobs, the run queue, threads and DPCs, the workers that run them, and
//! the host that ties them together.

pub mod counters;
pub mod dpc;
pub mod freelist;
pub mod host;
pub mod runq;
pub mod schob;
pub mod thread;
pub(crate) mod worker;

use core::any::Any;

pub use counters::HostStats;
pub use dpc::{dpc_create, dpc_self, DpcAttrs};
pub use freelist::{DefaultOps, Freelist, FreelistAttrs, FreelistSnapshot, NodeOps};
pub use host::{current_host, Host, PoolStats};
pub use runq::{Prioritized, RunQueue};
pub use schob::{SchobId, SchobState, SchobType};
pub use thread::{exit, thread_create, thread_self, yield_now, ThreadAttrs};

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
