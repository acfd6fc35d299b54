//! nk_r - a user-space cooperative scheduling kernel
//!
//! A [`Host`] runs schedulable objects ("schobs") on a pool of OS worker
//! threads. A schob is either
//!
//! - a thread: has its own stack, runs until it yields, blocks on a port, or
//!   exits; or
//! - a DPC (deferred procedure call): runs once, to completion, on the
//!   worker's stack.
//!
//! Schobs talk through [`Port`]s. A thread-style port queues messages for
//! threads blocked in [`msg_recv`]; a DPC-style port spawns a DPC for every
//! message it receives.
//!
//! ```no_run
//! use nk_r::{msg_recv, msg_send, thread_create, Host, PortType, ThreadAttrs};
//! use std::sync::Arc;
//!
//! let host = Host::new()?;
//! let port = host.port_create(PortType::Thread);
//! let rx = port.clone();
//! host.run(2, move || {
//!     thread_create(
//!         move || {
//!             let msg = msg_recv(&rx).unwrap();
//!             assert_eq!(msg.data1_as::<u32>(), Some(&7));
//!         },
//!         ThreadAttrs::default(),
//!     )
//!     .unwrap();
//!     msg_send(&port, None, Some(Arc::new(7u32)), None).unwrap();
//! })?;
//! host.destroy()?;
//! # Ok::<(), nk_r::KernError>(())
//! ```

pub mod arch;
pub mod config;
pub mod error;
pub mod ipc;
pub mod kern;

pub use config::{
    HostConfig, MAX_WORKERS, PRIO_DEFAULT, PRIO_MAX, PRIO_MIN, STACK_DEFAULT, STACK_MAX,
    STACK_MIN, STACK_RESERVE,
};
pub use error::{ErrorKind, KernError, KernResult};
pub use ipc::{msg_recv, msg_send, DpcHandler, Message, Payload, Port, PortId, PortType};
pub use kern::{
    current_host, dpc_create, dpc_self, exit, thread_create, thread_self, yield_now, DpcAttrs,
    Host, HostStats, PoolStats, SchobId, SchobState, SchobType, ThreadAttrs,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
