//! Schedulable Objects
//!
//! A schob is anything the workers can run: a thread (own stack, may
//! suspend) or a DPC (no stack, runs once to completion). A `Schob` value is
//! owned by exactly one place at a time: the run queue, the wakeup queue, a
//! port's waiter queue, or the worker running it. Moving the value is how it
//! changes queues, so it can never sit on two at once.

use core::fmt;

use super::dpc::DpcNode;
use super::runq::Prioritized;
use super::thread::ThreadHandle;

// ============================================================================
// Schob Identifier
// ============================================================================

/// Host-unique schob identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchobId(pub u64);

impl fmt::Display for SchobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "schob#{}", self.0)
    }
}

// ============================================================================
// Type and State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchobType {
    /// Cooperatively-scheduled thread with its own stack
    Thread,
    /// Deferred procedure call, runs exactly once
    Dpc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchobState {
    /// On the run queue (or the wakeup queue on its way there)
    Ready,
    /// Executing on a worker
    Running,
    /// Parked on a port's waiter queue
    Waiting,
    /// Finished, waiting to be reclaimed
    Zombie,
}

impl SchobState {
    /// Legal lifecycle edges
    pub fn can_transition(self, to: SchobState) -> bool {
        use SchobState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Running, Ready)
                | (Running, Waiting)
                | (Running, Zombie)
                | (Waiting, Ready)
        )
    }
}

// ============================================================================
// Schob
// ============================================================================

/// Per-kind payload of a schob
pub(crate) enum SchobBody {
    Thread(ThreadHandle),
    Dpc(Box<DpcNode>),
}

pub(crate) struct Schob {
    id: SchobId,
    state: SchobState,
    prio: u32,
    /// Index of the worker running this schob (only while `Running`)
    hostthd: Option<usize>,
    pub(crate) body: SchobBody,
}

impl Schob {
    /// New schob in the `Ready` state
    pub(crate) fn new(id: SchobId, prio: u32, body: SchobBody) -> Self {
        Self {
            id,
            state: SchobState::Ready,
            prio,
            hostthd: None,
            body,
        }
    }

    pub(crate) fn id(&self) -> SchobId {
        self.id
    }

    pub(crate) fn state(&self) -> SchobState {
        self.state
    }

    pub(crate) fn prio(&self) -> u32 {
        self.prio
    }

    pub(crate) fn hostthd(&self) -> Option<usize> {
        self.hostthd
    }

    pub(crate) fn schob_type(&self) -> SchobType {
        match self.body {
            SchobBody::Thread(_) => SchobType::Thread,
            SchobBody::Dpc(_) => SchobType::Dpc,
        }
    }

    /// Move to `to`, tracking worker affinity
    pub(crate) fn set_state(&mut self, to: SchobState) {
        debug_assert!(
            self.state.can_transition(to),
            "{}: illegal transition {:?} -> {:?}",
            self.id,
            self.state,
            to
        );
        self.state = to;
        if to != SchobState::Running {
            self.hostthd = None;
        }
    }

    /// Mark running on worker `index`
    pub(crate) fn dispatch(&mut self, index: usize) {
        self.set_state(SchobState::Running);
        self.hostthd = Some(index);
    }

    pub(crate) fn thread_mut(&mut self) -> Option<&mut ThreadHandle> {
        match &mut self.body {
            SchobBody::Thread(t) => Some(t),
            SchobBody::Dpc(_) => None,
        }
    }
}

impl Prioritized for Schob {
    fn priority(&self) -> u32 {
        self.prio
    }
}

impl fmt::Debug for Schob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schob")
            .field("id", &self.id)
            .field("type", &self.schob_type())
            .field("state", &self.state)
            .field("prio", &self.prio)
            .field("hostthd", &self.hostthd)
            .finish()
    }
}
