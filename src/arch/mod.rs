//! Architecture-specific context switching for nk_r
//!
//! The scheduler core sees exactly two operations:
//!
//! - [`create_ctx`]: lay out an initial frame on a fresh stack so that the
//!   first switch onto it calls `entry(data1, data2, data3)`.
//! - [`switch_ctx`]: save the callee-saved state of the current context on
//!   its own stack, store the resulting stack pointer through `from`, load
//!   `to`, and resume there. The resumed side sees `reason` as the return
//!   value of its own earlier `switch_ctx` call.
//!
//! Each supported target implements [`ContextSwitch`] with naked functions;
//! nothing outside this module depends on frame layout.

use core::ffi::c_void;

#[cfg(all(unix, target_arch = "aarch64"))]
pub mod aarch64;

#[cfg(all(unix, target_arch = "x86_64"))]
pub mod x86_64;

#[cfg(all(unix, target_arch = "aarch64"))]
pub use aarch64::ArchImpl;

#[cfg(all(unix, target_arch = "x86_64"))]
pub use x86_64::ArchImpl;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("nk_r has no context-switch implementation for this target");

/// Saved top-of-stack of a suspended context
pub type StackPtr = *mut u8;

/// First function run on a fresh context. Must never return.
pub type EntryFn = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void);

/// Why a thread handed control back to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum YieldReason {
    /// Still runnable, put it back on the run queue
    Ready = 0,
    /// Finished, reclaim it
    Zombie = 1,
    /// Park it on the port recorded by the worker
    Waiting = 2,
}

impl YieldReason {
    pub fn from_raw(raw: usize) -> Option<Self> {
        match raw {
            0 => Some(Self::Ready),
            1 => Some(Self::Zombie),
            2 => Some(Self::Waiting),
            _ => None,
        }
    }
}

/// Per-architecture context primitive
pub trait ContextSwitch {
    /// Build an initial frame below `stack_top`, returning the stack pointer
    /// to hand to [`ContextSwitch::switch_ctx`].
    ///
    /// # Safety
    /// `stack_top` must be the exclusive upper end of a writable region large
    /// enough for the frame and for everything `entry` will run.
    unsafe fn create_ctx(stack_top: *mut u8, entry: EntryFn, data: [*mut c_void; 3]) -> StackPtr;

    /// Suspend the current context into `*from` and resume `to`.
    ///
    /// # Safety
    /// `to` must come from `create_ctx` or from a previous suspension that
    /// has not been resumed since. `from` must stay valid until resumed.
    unsafe fn switch_ctx(from: *mut StackPtr, to: StackPtr, reason: usize) -> usize;
}

/// Create an initial switchable context on a stack
///
/// # Safety
/// See [`ContextSwitch::create_ctx`].
pub unsafe fn create_ctx(
    stack_top: *mut u8,
    entry: EntryFn,
    data1: *mut c_void,
    data2: *mut c_void,
    data3: *mut c_void,
) -> StackPtr {
    ArchImpl::create_ctx(stack_top, entry, [data1, data2, data3])
}

/// Switch from the current context to `to`
///
/// Returns the reason passed by whoever eventually switches back to us.
/// Unknown codes read as [`YieldReason::Zombie`] so a corrupted context is
/// reclaimed instead of rescheduled.
///
/// # Safety
/// See [`ContextSwitch::switch_ctx`].
pub unsafe fn switch_ctx(from: *mut StackPtr, to: StackPtr, reason: YieldReason) -> YieldReason {
    let raw = ArchImpl::switch_ctx(from, to, reason as usize);
    YieldReason::from_raw(raw).unwrap_or(YieldReason::Zombie)
}
