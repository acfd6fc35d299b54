//! AArch64 (AAPCS64) context switch
//!
//! `nk_switch` saves x19-x30 and d8-d15 in a 160-byte frame:
//!
//! ```text
//! sp + 0    x19 x20
//! sp + 16   x21 x22
//! sp + 32   x23 x24
//! sp + 48   x25 x26
//! sp + 64   x27 x28
//! sp + 80   x29 x30
//! sp + 96   d8  d9   ...  sp + 144  d14 d15
//! ```
//!
//! A fresh frame has x30 = `nk_trampoline`, x19 = entry and x20..x22 = the
//! three arguments.

use core::arch::naked_asm;
use core::ffi::c_void;

use super::{ContextSwitch, EntryFn, StackPtr};

/// AArch64 implementation of [`ContextSwitch`]
pub struct Aarch64;

/// Type alias for the AArch64 implementation
pub type ArchImpl = Aarch64;

const FRAME_BYTES: usize = 160;

#[unsafe(naked)]
unsafe extern "C" fn nk_switch(from: *mut StackPtr, to: StackPtr, reason: usize) -> usize {
    naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x9, sp",
        "str x9, [x0]",
        "mov sp, x1",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "mov x0, x2",
        "ret",
    )
}

#[unsafe(naked)]
unsafe extern "C" fn nk_trampoline() -> ! {
    naked_asm!(
        "mov x0, x20",
        "mov x1, x21",
        "mov x2, x22",
        "blr x19",
        "brk #0x1",
    )
}

impl ContextSwitch for Aarch64 {
    unsafe fn create_ctx(stack_top: *mut u8, entry: EntryFn, data: [*mut c_void; 3]) -> StackPtr {
        let top = (stack_top as usize) & !0xf;
        let frame = (top - FRAME_BYTES) as *mut usize;
        for word in 0..FRAME_BYTES / 8 {
            frame.add(word).write(0);
        }
        frame.add(0).write(entry as *const () as usize);
        frame.add(1).write(data[0] as usize);
        frame.add(2).write(data[1] as usize);
        frame.add(3).write(data[2] as usize);
        frame.add(11).write(nk_trampoline as *const () as usize);
        frame.cast()
    }

    unsafe fn switch_ctx(from: *mut StackPtr, to: StackPtr, reason: usize) -> usize {
        nk_switch(from, to, reason)
    }
}
