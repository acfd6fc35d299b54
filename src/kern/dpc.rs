//! Deferred Procedure Calls
//!
//! A DPC is a one-shot schob without a stack of its own. It runs on the
//! worker's native stack, from start to finish, and cannot block: receiving
//! from a port or yielding inside a DPC is an error.

use crate::config::PRIO_DEFAULT;
use crate::error::{KernError, KernResult};
use crate::kern::schob::SchobId;
use crate::kern::thread::BoxedFn;
use crate::kern::worker::{self, Current};

/// Pooled DPC state
#[derive(Default)]
pub(crate) struct DpcNode {
    pub(crate) func: Option<BoxedFn>,
}

/// Creation attributes for a DPC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpcAttrs {
    /// Scheduling priority, higher runs first
    pub prio: u32,
}

impl Default for DpcAttrs {
    fn default() -> Self {
        Self { prio: PRIO_DEFAULT }
    }
}

impl DpcAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prio(mut self, prio: u32) -> Self {
        self.prio = prio;
        self
    }
}

/// Queue `func` to run once on the current host
pub fn dpc_create<F>(func: F, attrs: DpcAttrs) -> KernResult<SchobId>
where
    F: FnOnce() + Send + 'static,
{
    let host = worker::current_host().ok_or(KernError::NoContext)?;
    host.spawn_dpc(Box::new(func), attrs)
}

/// Identifier of the calling DPC, if any
pub fn dpc_self() -> Option<SchobId> {
    match worker::current()? {
        Current::Dpc { id } => Some(id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpc_attrs() {
        assert_eq!(DpcAttrs::default().prio, PRIO_DEFAULT);
        assert_eq!(DpcAttrs::new().with_prio(3).prio, 3);
    }

    #[test]
    fn test_dpc_outside_context() {
        assert_eq!(
            dpc_create(|| {}, DpcAttrs::default()),
            Err(KernError::NoContext)
        );
        assert_eq!(dpc_self(), None);
    }
}
