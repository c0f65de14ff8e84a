//! Interrupt trampolines.
//!
//! Every vector funnels through `isr_common`, which pushes the 15 general
//! registers to complete the uniform [`InterruptFrame`], aligns the stack to
//! 16 bytes, calls the C-level dispatcher, and returns via `iretq`.
//!
//! The CPU pushes an error code only for vectors 8, 10-14, 17, 21 and 29-30;
//! every other trampoline injects a zero placeholder so the frame shape is
//! identical for all vectors.

use core::arch::global_asm;

// Common tail: the stack already holds (top-down) the CPU frame, the error
// code (real or injected) and the vector number. Push registers so ascending
// memory reads r15..rax | int_no | err_code | rip | cs | rflags | rsp | ss.
global_asm!(
    r#"
.global isr_common
isr_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    mov rbp, rsp
    and rsp, -16
    call interrupt_dispatch
    mov rsp, rbp

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax
    add rsp, 16
    iretq
"#
);

/// Trampoline for a vector where the CPU does not push an error code: inject
/// a zero placeholder, push the vector, join the common path.
macro_rules! isr_stub {
    ($name:ident, $vector:literal) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push 0\n",
            "    push ",
            stringify!($vector),
            "\n",
            "    jmp isr_common\n"
        ));
        extern "C" {
            pub fn $name();
        }
    };
}

/// Trampoline for a vector where the CPU pushes an error code itself.
macro_rules! isr_stub_err {
    ($name:ident, $vector:literal) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "    push ",
            stringify!($vector),
            "\n",
            "    jmp isr_common\n"
        ));
        extern "C" {
            pub fn $name();
        }
    };
}

// CPU exceptions 0-31.
isr_stub!(isr0, 0);
isr_stub!(isr1, 1);
isr_stub!(isr2, 2);
isr_stub!(isr3, 3);
isr_stub!(isr4, 4);
isr_stub!(isr5, 5);
isr_stub!(isr6, 6);
isr_stub!(isr7, 7);
isr_stub_err!(isr8, 8);
isr_stub!(isr9, 9);
isr_stub_err!(isr10, 10);
isr_stub_err!(isr11, 11);
isr_stub_err!(isr12, 12);
isr_stub_err!(isr13, 13);
isr_stub_err!(isr14, 14);
isr_stub!(isr15, 15);
isr_stub!(isr16, 16);
isr_stub_err!(isr17, 17);
isr_stub!(isr18, 18);
isr_stub!(isr19, 19);
isr_stub!(isr20, 20);
isr_stub_err!(isr21, 21);
isr_stub!(isr22, 22);
isr_stub!(isr23, 23);
isr_stub!(isr24, 24);
isr_stub!(isr25, 25);
isr_stub!(isr26, 26);
isr_stub!(isr27, 27);
isr_stub!(isr28, 28);
isr_stub_err!(isr29, 29);
isr_stub_err!(isr30, 30);
isr_stub!(isr31, 31);

// Hardware IRQs remapped to vectors 32-47.
isr_stub!(irq0, 32);
isr_stub!(irq1, 33);
isr_stub!(irq2, 34);
isr_stub!(irq3, 35);
isr_stub!(irq4, 36);
isr_stub!(irq5, 37);
isr_stub!(irq6, 38);
isr_stub!(irq7, 39);
isr_stub!(irq8, 40);
isr_stub!(irq9, 41);
isr_stub!(irq10, 42);
isr_stub!(irq11, 43);
isr_stub!(irq12, 44);
isr_stub!(irq13, 45);
isr_stub!(irq14, 46);
isr_stub!(irq15, 47);

// Default no-op trampoline for vectors 48-255.
isr_stub!(isr_default, 255);
