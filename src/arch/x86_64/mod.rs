//! x86_64 (System V) context switch
//!
//! Frame saved by `nk_switch`, lowest address first:
//!
//! ```text
//! sp + 0   mxcsr (4 bytes), x87 control word (2 bytes)
//! sp + 8   r15
//! sp + 16  r14
//! sp + 24  r13
//! sp + 32  r12
//! sp + 40  rbx
//! sp + 48  rbp
//! sp + 56  return address
//! ```
//!
//! The two control words are callee-saved in the SysV ABI, so a thread's
//! rounding mode and exception masks stay with that thread.
//!
//! A fresh frame returns into `nk_trampoline` with `r12` = entry and
//! `r13..r15` = the three arguments.

use core::arch::naked_asm;
use core::ffi::c_void;

use super::{ContextSwitch, EntryFn, StackPtr};

/// x86_64 implementation of [`ContextSwitch`]
pub struct X86_64;

/// Type alias for the x86_64 implementation
pub type ArchImpl = X86_64;

const FRAME_WORDS: usize = 8;

/// MXCSR and x87 control word at power-on: all exceptions masked, round to
/// nearest
const CSR_DEFAULT: usize = 0x1f80 | (0x037f << 32);

#[unsafe(naked)]
unsafe extern "C" fn nk_switch(from: *mut StackPtr, to: StackPtr, reason: usize) -> usize {
    naked_asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "sub rsp, 8",
        "stmxcsr dword ptr [rsp]",
        "fnstcw word ptr [rsp + 4]",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "ldmxcsr dword ptr [rsp]",
        "fldcw word ptr [rsp + 4]",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov rax, rdx",
        "ret",
    )
}

// rsp is 16-byte aligned here (the frame's return slot sat at top - 8), so
// the call below meets the ABI's alignment rule.
#[unsafe(naked)]
unsafe extern "C" fn nk_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r13",
        "mov rsi, r14",
        "mov rdx, r15",
        "call r12",
        "ud2",
    )
}

impl ContextSwitch for X86_64 {
    unsafe fn create_ctx(stack_top: *mut u8, entry: EntryFn, data: [*mut c_void; 3]) -> StackPtr {
        let top = (stack_top as usize) & !0xf;
        let frame = (top - FRAME_WORDS * 8) as *mut usize;
        frame.add(0).write(CSR_DEFAULT);
        frame.add(1).write(data[2] as usize);
        frame.add(2).write(data[1] as usize);
        frame.add(3).write(data[0] as usize);
        frame.add(4).write(entry as *const () as usize);
        frame.add(5).write(0);
        frame.add(6).write(0);
        frame.add(7).write(nk_trampoline as *const () as usize);
        frame.cast()
    }

    unsafe fn switch_ctx(from: *mut StackPtr, to: StackPtr, reason: usize) -> usize {
        nk_switch(from, to, reason)
    }
}
