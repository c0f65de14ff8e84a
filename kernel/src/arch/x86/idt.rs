//! Interrupt Descriptor Table and C-level dispatch.
//!
//! 256 gates: vectors 0-31 route to the CPU exception trampolines, 32-47 to
//! the hardware IRQ trampolines, the rest to a no-op default. Dispatch
//! consults a dense array of registered handlers; unhandled exceptions dump
//! the register file and halt, unhandled IRQs are simply acknowledged.
//!
//! Like the GDT, the table is snapshotted at init so corruption can be
//! detected and repaired.

use crate::arch::x86::isr;
use crate::arch::x86::pic;
use core::arch::asm;
use core::mem::size_of;

/// Total IDT entries (the full vector range).
const IDT_ENTRIES: usize = 256;

/// GDT selector for the Ring 0 code segment.
const KERNEL_CODE_SEG: u16 = 0x08;

// Gate type attributes (64-bit gates in long mode).
const GATE_INTERRUPT: u8 = 0x8E; // Present, DPL=0, interrupt gate
const GATE_TRAP_DPL3: u8 = 0xEF; // Present, DPL=3, trap gate

/// x86-64 IDT entry (16 bytes).
#[repr(C, packed)]
#[derive(Copy, Clone, PartialEq, Eq)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    ist: u8,
    type_attr: u8,
    offset_mid: u16,
    offset_high: u32,
    _reserved: u32,
}

const EMPTY_ENTRY: IdtEntry = IdtEntry {
    offset_low: 0,
    selector: 0,
    ist: 0,
    type_attr: 0,
    offset_mid: 0,
    offset_high: 0,
    _reserved: 0,
};

#[repr(C, packed)]
struct IdtDescriptor {
    size: u16,
    offset: u64,
}

static mut IDT: [IdtEntry; IDT_ENTRIES] = [EMPTY_ENTRY; IDT_ENTRIES];
static mut IDT_BACKUP: [IdtEntry; IDT_ENTRIES] = [EMPTY_ENTRY; IDT_ENTRIES];
static mut IDT_DESC: IdtDescriptor = IdtDescriptor { size: 0, offset: 0 };

/// Uniform interrupt frame: the register file pushed by the trampoline
/// followed by the CPU-pushed tail. Trampolines inject a zero error code
/// where the CPU does not push one, so this shape holds for every vector.
#[repr(C)]
pub struct InterruptFrame {
    // Pushed by the trampoline (last push = lowest address = first field)
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub int_no: u64,
    pub err_code: u64,
    // Pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A registered interrupt handler.
pub type InterruptHandler = fn(&mut InterruptFrame);

/// Dense handler array indexed by vector. Written only at init time.
static mut HANDLERS: [Option<InterruptHandler>; IDT_ENTRIES] = [None; IDT_ENTRIES];

/// Frame of the interrupt currently being dispatched, published so the
/// scheduler's tick callback can reach the interrupted context.
static mut ACTIVE_FRAME: *mut InterruptFrame = core::ptr::null_mut();

/// Exception names for vectors 0-31, used in fault dumps.
const EXCEPTION_NAMES: [&str; 32] = [
    "Divide By Zero",
    "Debug",
    "Non-maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 Floating-Point Exception",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
];

/// Name of an exception vector, or "Unknown" past the architectural range.
pub fn exception_name(vector: u64) -> &'static str {
    EXCEPTION_NAMES.get(vector as usize).copied().unwrap_or("Unknown")
}

fn set_gate(num: usize, handler: unsafe extern "C" fn(), type_attr: u8) {
    let addr = handler as *const () as u64;
    unsafe {
        IDT[num] = IdtEntry {
            offset_low: (addr & 0xFFFF) as u16,
            selector: KERNEL_CODE_SEG,
            ist: 0,
            type_attr,
            offset_mid: ((addr >> 16) & 0xFFFF) as u16,
            offset_high: ((addr >> 32) & 0xFFFF_FFFF) as u32,
            _reserved: 0,
        };
    }
}

/// Populate the IDT, snapshot it, initialize the PIC and load via `lidt`.
pub fn init() {
    set_gate(0, isr::isr0, GATE_INTERRUPT);
    set_gate(1, isr::isr1, GATE_INTERRUPT);
    set_gate(2, isr::isr2, GATE_INTERRUPT);
    set_gate(3, isr::isr3, GATE_INTERRUPT);
    set_gate(4, isr::isr4, GATE_INTERRUPT);
    set_gate(5, isr::isr5, GATE_INTERRUPT);
    set_gate(6, isr::isr6, GATE_INTERRUPT);
    set_gate(7, isr::isr7, GATE_INTERRUPT);
    set_gate(8, isr::isr8, GATE_INTERRUPT);
    set_gate(9, isr::isr9, GATE_INTERRUPT);
    set_gate(10, isr::isr10, GATE_INTERRUPT);
    set_gate(11, isr::isr11, GATE_INTERRUPT);
    set_gate(12, isr::isr12, GATE_INTERRUPT);
    set_gate(13, isr::isr13, GATE_INTERRUPT);
    set_gate(14, isr::isr14, GATE_INTERRUPT);
    set_gate(15, isr::isr15, GATE_INTERRUPT);
    set_gate(16, isr::isr16, GATE_INTERRUPT);
    set_gate(17, isr::isr17, GATE_INTERRUPT);
    set_gate(18, isr::isr18, GATE_INTERRUPT);
    set_gate(19, isr::isr19, GATE_INTERRUPT);
    set_gate(20, isr::isr20, GATE_INTERRUPT);
    set_gate(21, isr::isr21, GATE_INTERRUPT);
    set_gate(22, isr::isr22, GATE_INTERRUPT);
    set_gate(23, isr::isr23, GATE_INTERRUPT);
    set_gate(24, isr::isr24, GATE_INTERRUPT);
    set_gate(25, isr::isr25, GATE_INTERRUPT);
    set_gate(26, isr::isr26, GATE_INTERRUPT);
    set_gate(27, isr::isr27, GATE_INTERRUPT);
    set_gate(28, isr::isr28, GATE_INTERRUPT);
    set_gate(29, isr::isr29, GATE_INTERRUPT);
    set_gate(30, isr::isr30, GATE_INTERRUPT);
    set_gate(31, isr::isr31, GATE_INTERRUPT);

    set_gate(32, isr::irq0, GATE_INTERRUPT);
    set_gate(33, isr::irq1, GATE_INTERRUPT);
    set_gate(34, isr::irq2, GATE_INTERRUPT);
    set_gate(35, isr::irq3, GATE_INTERRUPT);
    set_gate(36, isr::irq4, GATE_INTERRUPT);
    set_gate(37, isr::irq5, GATE_INTERRUPT);
    set_gate(38, isr::irq6, GATE_INTERRUPT);
    set_gate(39, isr::irq7, GATE_INTERRUPT);
    set_gate(40, isr::irq8, GATE_INTERRUPT);
    set_gate(41, isr::irq9, GATE_INTERRUPT);
    set_gate(42, isr::irq10, GATE_INTERRUPT);
    set_gate(43, isr::irq11, GATE_INTERRUPT);
    set_gate(44, isr::irq12, GATE_INTERRUPT);
    set_gate(45, isr::irq13, GATE_INTERRUPT);
    set_gate(46, isr::irq14, GATE_INTERRUPT);
    set_gate(47, isr::irq15, GATE_INTERRUPT);

    for vector in 48..IDT_ENTRIES {
        set_gate(vector, isr::isr_default, GATE_INTERRUPT);
    }

    save_backup();

    pic::init();

    unsafe {
        IDT_DESC = IdtDescriptor {
            size: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
            offset: core::ptr::addr_of!(IDT) as u64,
        };
        asm!(
            "lidt [{}]",
            in(reg) core::ptr::addr_of!(IDT_DESC),
            options(nostack, preserves_flags)
        );
    }
}

/// Register a handler for `vector`. One slot per vector; only written
/// during initialization.
pub fn register_handler(vector: u8, handler: InterruptHandler) {
    unsafe {
        HANDLERS[vector as usize] = Some(handler);
    }
}

/// Re-point a vector's gate at the default trampoline with DPL=3 so Ring 3
/// code may raise it with `int`. Used by the syscall layer for its trap
/// vector.
pub fn set_user_gate(vector: u8) {
    set_gate(vector as usize, isr::isr_default, GATE_TRAP_DPL3);
    save_backup();
    unsafe {
        asm!(
            "lidt [{}]",
            in(reg) core::ptr::addr_of!(IDT_DESC),
            options(nostack, preserves_flags)
        );
    }
}

/// Frame of the interrupt currently being dispatched, if any.
///
/// Valid only while a handler invoked by [`interrupt_dispatch`] is on the
/// call stack.
pub fn active_frame() -> Option<&'static mut InterruptFrame> {
    unsafe {
        if ACTIVE_FRAME.is_null() {
            None
        } else {
            Some(&mut *ACTIVE_FRAME)
        }
    }
}

/// C-level dispatch, invoked by every trampoline with the uniform frame.
///
/// Registered handlers win; otherwise exceptions dump-and-halt and hardware
/// IRQs fall through to the EOI below. The interrupt-enable flag stays clear
/// from trampoline entry to `iretq`, so dispatch can never re-enter.
#[no_mangle]
extern "C" fn interrupt_dispatch(frame: &mut InterruptFrame) {
    let vector = frame.int_no;

    unsafe {
        ACTIVE_FRAME = frame;
    }

    let handler = unsafe { HANDLERS[(vector & 0xFF) as usize] };
    match handler {
        Some(handler) => handler(frame),
        None if vector < 32 => {
            dump_fault(frame);
            crate::log_critical!("System halted due to unhandled exception");
            halt();
        }
        None => {}
    }

    unsafe {
        ACTIVE_FRAME = core::ptr::null_mut();
    }

    // Acknowledge hardware IRQs: slave first for vectors >= 40, then always
    // the master. Sent before dispatch completes.
    if (32..48).contains(&vector) {
        pic::send_eoi((vector - 32) as u8);
    }
}

/// Log the full register file and fault frame.
pub fn dump_fault(frame: &InterruptFrame) {
    crate::log_error!(
        "Exception: {} (vector {}, error code {:#x}) at RIP={:#018x}",
        exception_name(frame.int_no),
        frame.int_no,
        frame.err_code,
        frame.rip
    );
    crate::log_error!(
        "RAX={:#018x} RBX={:#018x} RCX={:#018x} RDX={:#018x}",
        frame.rax, frame.rbx, frame.rcx, frame.rdx
    );
    crate::log_error!(
        "RSI={:#018x} RDI={:#018x} RBP={:#018x} RSP={:#018x}",
        frame.rsi, frame.rdi, frame.rbp, frame.rsp
    );
    crate::log_error!(
        "R8 ={:#018x} R9 ={:#018x} R10={:#018x} R11={:#018x}",
        frame.r8, frame.r9, frame.r10, frame.r11
    );
    crate::log_error!(
        "R12={:#018x} R13={:#018x} R14={:#018x} R15={:#018x}",
        frame.r12, frame.r13, frame.r14, frame.r15
    );
    crate::log_error!(
        "RFLAGS={:#010x} CS={:#06x} SS={:#06x}",
        frame.rflags, frame.cs, frame.ss
    );
}

/// Halt the CPU with interrupts disabled.
pub fn halt() -> ! {
    loop {
        unsafe {
            asm!("cli; hlt", options(nomem, nostack));
        }
    }
}

/// Set the interrupt-enable flag.
pub fn enable() {
    unsafe {
        asm!("sti", options(nomem, nostack));
    }
}

/// Clear the interrupt-enable flag.
pub fn disable() {
    unsafe {
        asm!("cli", options(nomem, nostack));
    }
}

/// Read the interrupt-enable flag.
pub fn state() -> bool {
    crate::sync::spinlock::interrupts_enabled()
}

/// Snapshot the table for later integrity checks.
fn save_backup() {
    unsafe {
        IDT_BACKUP = IDT;
    }
}

/// Verify the IDT against its backup and the loaded IDTR.
pub fn check_integrity() -> bool {
    unsafe {
        let mut idtr = IdtDescriptor { size: 0, offset: 0 };
        asm!("sidt [{}]", in(reg) core::ptr::addr_of_mut!(idtr), options(nostack, preserves_flags));
        if idtr.offset != core::ptr::addr_of!(IDT) as u64 {
            return false;
        }
        if idtr.size != (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16 {
            return false;
        }
        let a = core::slice::from_raw_parts(
            core::ptr::addr_of!(IDT) as *const u8,
            IDT_ENTRIES * size_of::<IdtEntry>(),
        );
        let b = core::slice::from_raw_parts(
            core::ptr::addr_of!(IDT_BACKUP) as *const u8,
            IDT_ENTRIES * size_of::<IdtEntry>(),
        );
        a == b
    }
}

/// Restore the IDT from backup and reload IDTR.
pub fn recover() -> bool {
    unsafe {
        IDT = IDT_BACKUP;
        asm!(
            "lidt [{}]",
            in(reg) core::ptr::addr_of!(IDT_DESC),
            options(nostack, preserves_flags)
        );
    }
    crate::log_warn!("IDT: recovered descriptor table from backup");
    check_integrity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_trampoline_pushes() {
        // 15 GPRs + int_no + err_code + 5 CPU-pushed words.
        assert_eq!(size_of::<InterruptFrame>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, r15), 0);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rax), 14 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, int_no), 15 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, err_code), 16 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, rip), 17 * 8);
        assert_eq!(core::mem::offset_of!(InterruptFrame, ss), 21 * 8);
    }

    #[test]
    fn exception_names_cover_architectural_vectors() {
        assert_eq!(exception_name(0), "Divide By Zero");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(13), "General Protection Fault");
        assert_eq!(exception_name(200), "Unknown");
    }

    #[test]
    fn idt_entry_is_16_bytes() {
        assert_eq!(size_of::<IdtEntry>(), 16);
    }
}
