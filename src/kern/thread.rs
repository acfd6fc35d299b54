//! Thread Management
//!
//! Threads are cooperatively scheduled schobs with a stack of their own. A
//! thread runs until it yields, blocks on a port, or exits; there is no
//! preemption. While it is suspended its callee-saved registers live on its
//! own stack and `ThreadNode::sp` points at them.
//!
//! Thread nodes come from the host's thread freelist. A recycled node keeps
//! its stack, so a create/exit cycle at a stable stack size never touches the
//! system allocator.

use core::ffi::c_void;
use core::ptr::{self, NonNull};
use std::panic::{self, AssertUnwindSafe};

use log::error;

use crate::arch::{self, StackPtr, YieldReason};
use crate::config::{
    round_stack_len, PRIO_DEFAULT, STACK_DEFAULT, STACK_GRANULE, STACK_MAX, STACK_MIN,
    STACK_RESERVE,
};
use crate::error::{KernError, KernResult};
use crate::ipc::Message;
use crate::kern::freelist::NodeOps;
use crate::kern::schob::SchobId;
use crate::kern::worker;

/// Entry point of a thread or DPC
pub(crate) type BoxedFn = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Thread Attributes
// ============================================================================

/// Creation attributes for a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadAttrs {
    /// Stack length in bytes, rounded up to a 4 KiB multiple
    pub stack_size: usize,
    /// Scheduling priority, higher runs first
    pub prio: u32,
}

impl Default for ThreadAttrs {
    fn default() -> Self {
        Self {
            stack_size: STACK_DEFAULT,
            prio: PRIO_DEFAULT,
        }
    }
}

impl ThreadAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn with_prio(mut self, prio: u32) -> Self {
        self.prio = prio;
        self
    }

    /// Check the stack size against the supported range
    pub fn validate(&self) -> KernResult<()> {
        if (STACK_MIN..=STACK_MAX).contains(&self.stack_size) {
            Ok(())
        } else {
            Err(KernError::InvalidStackSize {
                requested: self.stack_size,
                min: STACK_MIN,
                max: STACK_MAX,
            })
        }
    }
}

// ============================================================================
// Thread Stack
// ============================================================================

/// Thread stack mapped from the system
///
/// Layout, low to high: one inaccessible guard page, `STACK_RESERVE` bytes of
/// unwind headroom, then the `len` bytes the thread asked for. Pages are
/// committed on first touch, so an unused reserve costs address space only.
/// Running off the bottom faults on the guard page instead of writing into
/// someone else's memory.
pub(crate) struct Stack {
    base: NonNull<u8>,
    len: usize,
    mapped: usize,
}

// SAFETY: the stack is plain memory owned by exactly one thread node.
unsafe impl Send for Stack {}

impl Stack {
    fn new(len: usize) -> KernResult<Self> {
        let guard = page_size();
        let mapped = guard
            .checked_add(STACK_RESERVE)
            .and_then(|n| n.checked_add(len))
            .ok_or(KernError::NoMemory)?;

        // SAFETY: anonymous private mapping, no file or fixed address.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(KernError::NoMemory);
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or(KernError::NoMemory)?;
        let stack = Self { base, len, mapped };

        // SAFETY: the first page lies inside the mapping created above.
        if unsafe { libc::mprotect(addr, guard, libc::PROT_NONE) } != 0 {
            // `stack` unmaps on drop
            return Err(KernError::NoMemory);
        }
        Ok(stack)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// One past the highest usable byte
    fn top(&self) -> *mut u8 {
        // SAFETY: base..base+mapped is the mapping.
        unsafe { self.base.as_ptr().add(self.mapped) }
    }

    /// Lowest address of the inaccessible guard page
    #[cfg(test)]
    fn guard(&self) -> *const u8 {
        self.base.as_ptr()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: mapped in `Stack::new` with exactly this length.
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) } != 0 {
            error!("munmap of {}-byte thread stack failed", self.mapped);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => STACK_GRANULE,
    }
}

// ============================================================================
// Thread Node
// ============================================================================

/// Per-thread state that outlives individual scheduling decisions
pub(crate) struct ThreadNode {
    stack: Option<Stack>,
    /// Saved stack pointer while suspended
    pub(crate) sp: StackPtr,
    /// Message handed over by a sender while the thread was parked
    pub(crate) recv_slot: Option<Message>,
    entry: Option<BoxedFn>,
}

// SAFETY: `sp` points into the node's own stack; the node moves between
// workers only while the thread is suspended.
unsafe impl Send for ThreadNode {}

impl Default for ThreadNode {
    fn default() -> Self {
        Self {
            stack: None,
            sp: ptr::null_mut(),
            recv_slot: None,
            entry: None,
        }
    }
}

impl ThreadNode {
    /// Clear everything but the stack
    fn reset(&mut self) {
        self.sp = ptr::null_mut();
        self.recv_slot = None;
        self.entry = None;
    }

    pub(crate) fn stack_len(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::len)
    }

    /// Make sure the node owns a stack of exactly `len` (rounded) bytes
    pub(crate) fn prepare_stack(&mut self, len: usize) -> KernResult<()> {
        let len = round_stack_len(len);
        if self.stack_len() != len {
            // Release the old stack first so the peak stays at one stack
            self.stack = None;
            self.stack = Some(Stack::new(len)?);
        }
        Ok(())
    }
}

/// Thread freelist callbacks: pooled nodes keep their stacks
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ThreadNodeOps;

impl NodeOps<ThreadNode> for ThreadNodeOps {
    fn alloc(&self) -> Option<Box<ThreadNode>> {
        Some(Box::default())
    }

    fn zero(&self, node: &mut ThreadNode) {
        node.reset();
    }
}

// ============================================================================
// Thread Handle
// ============================================================================

/// Owning pointer to a live thread node
///
/// The node is reached through raw pointers from the thread's own stack while
/// it runs, so it is held as a raw allocation rather than a `Box`, and turned
/// back into one only when it returns to the freelist.
pub(crate) struct ThreadHandle(NonNull<ThreadNode>);

// SAFETY: see `ThreadNode`.
unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    pub(crate) fn from_box(node: Box<ThreadNode>) -> Self {
        Self(NonNull::from(Box::leak(node)))
    }

    pub(crate) fn into_box(self) -> Box<ThreadNode> {
        let raw = self.0.as_ptr();
        core::mem::forget(self);
        // SAFETY: produced by `from_box` and not yet released.
        unsafe { Box::from_raw(raw) }
    }

    pub(crate) fn as_ptr(&self) -> NonNull<ThreadNode> {
        self.0
    }

    /// Access the node of a thread that is not running
    pub(crate) fn node_mut(&mut self) -> &mut ThreadNode {
        // SAFETY: the handle owns the node; while the thread is suspended no
        // one else touches it.
        unsafe { self.0.as_mut() }
    }

    /// Install `entry` and build the first frame on the node's stack
    pub(crate) fn launch(&mut self, id: SchobId, entry: BoxedFn) -> KernResult<()> {
        let raw = self.0.as_ptr();
        let node = self.node_mut();
        let top = node.stack.as_ref().map(Stack::top).ok_or(KernError::NoMemory)?;
        node.entry = Some(entry);
        node.recv_slot = None;
        // SAFETY: `top` ends a live stack owned by this node; `thread_main`
        // never returns.
        node.sp = unsafe {
            arch::create_ctx(
                top,
                thread_main,
                raw.cast::<c_void>(),
                id.0 as usize as *mut c_void,
                ptr::null_mut(),
            )
        };
        Ok(())
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // SAFETY: produced by `from_box` and not yet released.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

// ============================================================================
// Thread Entry
// ============================================================================

/// First function on every thread stack
unsafe extern "C" fn thread_main(node: *mut c_void, id: *mut c_void, _unused: *mut c_void) {
    let node = node.cast::<ThreadNode>();
    let id = SchobId(id as usize as u64);
    if let Some(entry) = (*node).entry.take() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            error!("{id} panicked: {}", super::panic_message(payload.as_ref()));
        }
    }
    exit()
}

// ============================================================================
// Thread Operations
// ============================================================================

/// Create a thread on the current host
///
/// Callable from any thread or DPC. The new thread is `Ready` and starts
/// running `entry` when a worker picks it.
pub fn thread_create<F>(entry: F, attrs: ThreadAttrs) -> KernResult<SchobId>
where
    F: FnOnce() + Send + 'static,
{
    let host = worker::current_host().ok_or(KernError::NoContext)?;
    host.spawn_thread(Box::new(entry), attrs)
}

/// Give up the worker and go to the back of the run queue
pub fn yield_now() -> KernResult<()> {
    worker::suspend(YieldReason::Ready, None)
}

/// Terminate the calling thread
///
/// Returning from the entry closure does the same.
///
/// # Panics
/// Panics when called outside a thread.
pub fn exit() -> ! {
    match worker::suspend(YieldReason::Zombie, None) {
        Ok(()) => unreachable!("thread resumed after exit"),
        Err(err) => panic!("exit: {err}"),
    }
}

/// Identifier of the calling thread, if any
pub fn thread_self() -> Option<SchobId> {
    worker::current_thread().ok().map(|(id, _)| id)
}
