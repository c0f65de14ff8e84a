//! Low-level context switch routines.
//!
//! Two entry points over the fixed [`CpuContext`] layout (offsets are part
//! of the contract and asserted in `task::context`):
//!
//! - `context_switch(old, new)`: save the calling kernel context into `old`
//!   (resumable at the return point) and restore `new`. Used by voluntary
//!   yields from Ring 0.
//! - `context_restore(new)`: restore-only path. Returns to Ring 3 contexts
//!   via `iretq`; Ring 0 contexts (the idle case) resume via `ret` on their
//!   own stack.
//!
//! CR3 is switched by the scheduler before these run; the routines only
//! move register state.

use core::arch::global_asm;

// CpuContext field offsets:
//   rax=0   rbx=8   rcx=16  rdx=24  rsi=32  rdi=40  rbp=48  rsp=56
//   r8=64   r9=72   r10=80  r11=88  r12=96  r13=104 r14=112 r15=120
//   rip=128 rflags=136 cs=144 ss=152 ds=160 es=168 fs=176 gs=184 cr3=192
global_asm!(
    r#"
.global context_switch
context_switch:
    // rdi = old context, rsi = new context.
    mov [rdi + 0],   rax
    mov [rdi + 8],   rbx
    mov [rdi + 16],  rcx
    mov [rdi + 24],  rdx
    mov [rdi + 32],  rsi
    mov [rdi + 40],  rdi
    mov [rdi + 48],  rbp
    mov [rdi + 64],  r8
    mov [rdi + 72],  r9
    mov [rdi + 80],  r10
    mov [rdi + 88],  r11
    mov [rdi + 96],  r12
    mov [rdi + 104], r13
    mov [rdi + 112], r14
    mov [rdi + 120], r15

    // Resume point: the caller's return address, with RSP as it will be
    // after that return.
    mov rax, [rsp]
    mov [rdi + 128], rax
    lea rax, [rsp + 8]
    mov [rdi + 56],  rax

    pushfq
    pop rax
    mov [rdi + 136], rax

    // Ring 0 selectors for the saved kernel context.
    mov qword ptr [rdi + 144], 0x08
    mov qword ptr [rdi + 152], 0x10
    mov qword ptr [rdi + 160], 0x10
    mov qword ptr [rdi + 168], 0x10
    mov qword ptr [rdi + 176], 0x10
    mov qword ptr [rdi + 184], 0x10

    mov rax, cr3
    mov [rdi + 192], rax

    mov rdi, rsi
    // fall through into context_restore

.global context_restore
context_restore:
    // rdi = context to resume. Never returns.
    test qword ptr [rdi + 144], 3
    jz 2f

    // --- Ring 3 resume: rebuild the iretq frame ---
    mov rax, [rdi + 160]
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax

    push qword ptr [rdi + 152]   // SS
    push qword ptr [rdi + 56]    // RSP
    push qword ptr [rdi + 136]   // RFLAGS
    push qword ptr [rdi + 144]   // CS
    push qword ptr [rdi + 128]   // RIP

    mov rax, [rdi + 0]
    mov rbx, [rdi + 8]
    mov rcx, [rdi + 16]
    mov rdx, [rdi + 24]
    mov rsi, [rdi + 32]
    mov rbp, [rdi + 48]
    mov r8,  [rdi + 64]
    mov r9,  [rdi + 72]
    mov r10, [rdi + 80]
    mov r11, [rdi + 88]
    mov r12, [rdi + 96]
    mov r13, [rdi + 104]
    mov r14, [rdi + 112]
    mov r15, [rdi + 120]
    mov rdi, [rdi + 40]
    iretq

2:
    // --- Ring 0 resume (idle case): switch to the saved stack, ret ---
    mov rsp, [rdi + 56]
    push qword ptr [rdi + 128]   // return address
    push qword ptr [rdi + 136]   // saved RFLAGS

    mov rax, [rdi + 0]
    mov rbx, [rdi + 8]
    mov rcx, [rdi + 16]
    mov rdx, [rdi + 24]
    mov rsi, [rdi + 32]
    mov rbp, [rdi + 48]
    mov r8,  [rdi + 64]
    mov r9,  [rdi + 72]
    mov r10, [rdi + 80]
    mov r11, [rdi + 88]
    mov r12, [rdi + 96]
    mov r13, [rdi + 104]
    mov r14, [rdi + 112]
    mov r15, [rdi + 120]
    mov rdi, [rdi + 40]

    // Interrupt state comes back exactly as saved (RFLAGS.IF included).
    popfq
    ret
"#
);
