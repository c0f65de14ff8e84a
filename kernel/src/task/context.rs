//! Saved CPU context for context switching.
//!
//! The layout is shared with the assembly routines in `arch::x86::switch`;
//! field offsets are part of that contract and checked in the tests below.

/// CPU context saved and restored across a context switch.
///
/// Laid out so the restore trampoline can rebuild an `iretq` frame (Ring 3)
/// or return via `ret` (the Ring 0 idle case) directly from these fields.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CpuContext {
    pub rax: u64,    // offset 0
    pub rbx: u64,    // offset 8
    pub rcx: u64,    // offset 16
    pub rdx: u64,    // offset 24
    pub rsi: u64,    // offset 32
    pub rdi: u64,    // offset 40
    pub rbp: u64,    // offset 48
    pub rsp: u64,    // offset 56
    pub r8: u64,     // offset 64
    pub r9: u64,     // offset 72
    pub r10: u64,    // offset 80
    pub r11: u64,    // offset 88
    pub r12: u64,    // offset 96
    pub r13: u64,    // offset 104
    pub r14: u64,    // offset 112
    pub r15: u64,    // offset 120
    pub rip: u64,    // offset 128
    pub rflags: u64, // offset 136
    pub cs: u64,     // offset 144
    pub ss: u64,     // offset 152
    pub ds: u64,     // offset 160
    pub es: u64,     // offset 168
    pub fs: u64,     // offset 176
    pub gs: u64,     // offset 184
    /// Page-table base. Bookkeeping only: the scheduler switches CR3 before
    /// invoking the restore routines.
    pub cr3: u64,    // offset 192
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        CpuContext {
            rax: 0, rbx: 0, rcx: 0, rdx: 0,
            rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: 0,
            cs: 0, ss: 0, ds: 0, es: 0, fs: 0, gs: 0,
            cr3: 0,
        }
    }
}

extern "C" {
    /// Save the calling kernel context into `old`, then restore `new`.
    /// Returns (much later) when `old` is rescheduled.
    pub fn context_switch(old: *mut CpuContext, new: *const CpuContext);

    /// Restore `new` without saving anything. Never returns.
    pub fn context_restore(new: *const CpuContext) -> !;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_switch_asm_offsets() {
        assert_eq!(size_of::<CpuContext>(), 200);
        assert_eq!(offset_of!(CpuContext, rax), 0);
        assert_eq!(offset_of!(CpuContext, rsi), 32);
        assert_eq!(offset_of!(CpuContext, rdi), 40);
        assert_eq!(offset_of!(CpuContext, rsp), 56);
        assert_eq!(offset_of!(CpuContext, r15), 120);
        assert_eq!(offset_of!(CpuContext, rip), 128);
        assert_eq!(offset_of!(CpuContext, rflags), 136);
        assert_eq!(offset_of!(CpuContext, cs), 144);
        assert_eq!(offset_of!(CpuContext, ss), 152);
        assert_eq!(offset_of!(CpuContext, ds), 160);
        assert_eq!(offset_of!(CpuContext, gs), 184);
        assert_eq!(offset_of!(CpuContext, cr3), 192);
    }
}
