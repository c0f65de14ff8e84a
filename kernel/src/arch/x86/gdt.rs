//! Global Descriptor Table and Task State Segment.
//!
//! Fixed layout for a flat 64-bit address space:
//!   0x00: Null
//!   0x08: Kernel Code 64 (L=1, DPL=0)
//!   0x10: Kernel Data (DPL=0)
//!   0x18: User Code 64 (L=1, DPL=3)
//!   0x20: User Data (DPL=3)
//!   0x28: TSS (16-byte descriptor, 2 slots)
//!
//! The TSS carries RSP0, the kernel stack loaded on Ring 3 → Ring 0
//! transitions. A backup copy of the table is kept at init so corruption
//! can be detected (byte compare plus GDTR check) and repaired.

use core::arch::asm;
use core::mem::size_of;

/// Segment selectors (without RPL bits).
pub const KERNEL_CODE_SEL: u16 = 0x08;
pub const KERNEL_DATA_SEL: u16 = 0x10;
pub const USER_CODE_SEL: u16 = 0x18;
pub const USER_DATA_SEL: u16 = 0x20;
pub const TSS_SEL: u16 = 0x28;

/// Ring 3 request privilege level, OR'd into user selectors.
pub const RPL_USER: u16 = 3;

#[repr(C, packed)]
#[derive(Copy, Clone, PartialEq, Eq)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    flags_limit_high: u8,
    base_high: u8,
}

#[repr(C, packed)]
struct GdtDescriptor {
    size: u16,
    offset: u64,
}

/// 64-bit Task State Segment.
#[repr(C, packed)]
struct Tss {
    _reserved0: u32,
    rsp0: u64,
    rsp1: u64,
    rsp2: u64,
    _reserved1: u64,
    ist: [u64; 7],
    _reserved2: u64,
    _reserved3: u16,
    iopb_offset: u16,
}

/// 5 segment descriptors + 2 slots for the 16-byte TSS descriptor.
const GDT_ENTRIES: usize = 7;

const NULL_ENTRY: GdtEntry = GdtEntry {
    limit_low: 0,
    base_low: 0,
    base_mid: 0,
    access: 0,
    flags_limit_high: 0,
    base_high: 0,
};

static mut GDT: [GdtEntry; GDT_ENTRIES] = [NULL_ENTRY; GDT_ENTRIES];
static mut GDT_BACKUP: [GdtEntry; GDT_ENTRIES] = [NULL_ENTRY; GDT_ENTRIES];
static mut GDT_DESC: GdtDescriptor = GdtDescriptor { size: 0, offset: 0 };

static mut TSS: Tss = Tss {
    _reserved0: 0,
    rsp0: 0,
    rsp1: 0,
    rsp2: 0,
    _reserved1: 0,
    ist: [0; 7],
    _reserved2: 0,
    _reserved3: 0,
    iopb_offset: size_of::<Tss>() as u16,
};

/// Kernel stack used for Ring 3 → Ring 0 transitions (TSS.RSP0).
const INTERRUPT_STACK_SIZE: usize = 64 * 1024;

#[repr(C, align(16))]
struct InterruptStack([u8; INTERRUPT_STACK_SIZE]);

static mut INTERRUPT_STACK: InterruptStack = InterruptStack([0; INTERRUPT_STACK_SIZE]);

fn make_entry(base: u32, limit: u32, access: u8, flags: u8) -> GdtEntry {
    GdtEntry {
        limit_low: (limit & 0xFFFF) as u16,
        base_low: (base & 0xFFFF) as u16,
        base_mid: ((base >> 16) & 0xFF) as u8,
        access,
        flags_limit_high: ((limit >> 16) & 0x0F) as u8 | (flags << 4),
        base_high: ((base >> 24) & 0xFF) as u8,
    }
}

/// Install the 16-byte TSS descriptor across GDT slots 5 and 6.
fn set_tss_entry(base: u64, limit: u32) {
    unsafe {
        let base_lo = base as u32;
        // Access 0x89 = Present, DPL=0, Available 64-bit TSS
        GDT[5] = GdtEntry {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base_lo & 0xFFFF) as u16,
            base_mid: ((base_lo >> 16) & 0xFF) as u8,
            access: 0x89,
            flags_limit_high: ((limit >> 16) & 0x0F) as u8,
            base_high: ((base_lo >> 24) & 0xFF) as u8,
        };
        // High 8 bytes: upper 32 bits of base + reserved zero
        let high_ptr = core::ptr::addr_of_mut!(GDT[6]) as *mut u32;
        core::ptr::write_unaligned(high_ptr, (base >> 32) as u32);
        core::ptr::write_unaligned(high_ptr.add(1), 0);
    }
}

/// Initialize the GDT and TSS and load them on the current CPU.
pub fn init() {
    unsafe {
        GDT[0] = NULL_ENTRY;

        // Kernel Code 64: access 0x9A (P, DPL=0, code exec/read), flags 0x2 (L=1)
        GDT[1] = make_entry(0, 0, 0x9A, 0x2);

        // Kernel Data: access 0x92 (P, DPL=0, data r/w), flags 0xC (G=1, D=1)
        GDT[2] = make_entry(0, 0xFFFFF, 0x92, 0xC);

        // User Code 64: access 0xFA (P, DPL=3, code exec/read), flags 0x2 (L=1)
        GDT[3] = make_entry(0, 0, 0xFA, 0x2);

        // User Data: access 0xF2 (P, DPL=3, data r/w), flags 0xC
        GDT[4] = make_entry(0, 0xFFFFF, 0xF2, 0xC);

        let tss_base = core::ptr::addr_of!(TSS) as u64;
        set_tss_entry(tss_base, size_of::<Tss>() as u32 - 1);

        TSS.rsp0 = core::ptr::addr_of!(INTERRUPT_STACK.0) as u64 + INTERRUPT_STACK_SIZE as u64;

        GDT_DESC = GdtDescriptor {
            size: (GDT_ENTRIES * size_of::<GdtEntry>() - 1) as u16,
            offset: core::ptr::addr_of!(GDT) as u64,
        };

        asm!(
            "lgdt [{}]",
            in(reg) core::ptr::addr_of!(GDT_DESC),
            options(nostack, preserves_flags)
        );

        // Reload data segment registers with the kernel data selector.
        asm!(
            "mov ax, 0x10",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            out("eax") _,
            options(nostack)
        );

        // Far return to reload CS with the kernel code selector.
        asm!(
            "push 0x08",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            ".byte 0x48, 0xCB", // retfq
            "2:",
            tmp = out(reg) _,
            options(nostack)
        );

        asm!("ltr {0:x}", in(reg) TSS_SEL, options(nostack, preserves_flags));

        // Snapshot after ltr so the TSS descriptor's busy bit matches the
        // live table during integrity checks.
        save_backup();
    }
}

/// Clear the TSS descriptor's busy bit (0x8B back to 0x89) so `ltr` can be
/// executed again after a recovery.
fn clear_tss_busy_bit() {
    unsafe {
        let access = core::ptr::addr_of_mut!(GDT) as *mut u8;
        let access = access.add(5 * size_of::<GdtEntry>() + 5);
        core::ptr::write_volatile(access, core::ptr::read_volatile(access) & !0x02);
    }
}

/// Record the privileged stack pointer used on Ring 3 → Ring 0 transitions.
pub fn set_kernel_stack(stack_top: u64) {
    unsafe {
        TSS.rsp0 = stack_top;
    }
}

/// Top of the static interrupt stack.
pub fn interrupt_stack_top() -> u64 {
    unsafe { core::ptr::addr_of!(INTERRUPT_STACK.0) as u64 + INTERRUPT_STACK_SIZE as u64 }
}

/// Snapshot the table for later integrity checks.
fn save_backup() {
    unsafe {
        GDT_BACKUP = GDT;
    }
}

/// Verify the descriptor table against its boot-time backup and the loaded
/// GDTR. Returns `false` on any mismatch.
pub fn check_integrity() -> bool {
    unsafe {
        let mut gdtr = GdtDescriptor { size: 0, offset: 0 };
        asm!("sgdt [{}]", in(reg) core::ptr::addr_of_mut!(gdtr), options(nostack, preserves_flags));
        if gdtr.offset != core::ptr::addr_of!(GDT) as u64 {
            return false;
        }
        if gdtr.size != (GDT_ENTRIES * size_of::<GdtEntry>() - 1) as u16 {
            return false;
        }
        let current = core::ptr::addr_of!(GDT).read();
        let backup = core::ptr::addr_of!(GDT_BACKUP).read();
        let a = core::slice::from_raw_parts(
            &current as *const _ as *const u8,
            size_of::<[GdtEntry; GDT_ENTRIES]>(),
        );
        let b = core::slice::from_raw_parts(
            &backup as *const _ as *const u8,
            size_of::<[GdtEntry; GDT_ENTRIES]>(),
        );
        a == b
    }
}

/// Restore the table from its backup and reload GDTR. Returns the result of
/// a fresh integrity check.
pub fn recover() -> bool {
    unsafe {
        GDT = GDT_BACKUP;
        // The backup carries the busy bit from the first ltr; clear it or
        // the reload below faults.
        clear_tss_busy_bit();
        GDT_DESC = GdtDescriptor {
            size: (GDT_ENTRIES * size_of::<GdtEntry>() - 1) as u16,
            offset: core::ptr::addr_of!(GDT) as u64,
        };
        asm!(
            "lgdt [{}]",
            in(reg) core::ptr::addr_of!(GDT_DESC),
            options(nostack, preserves_flags)
        );
        asm!("ltr {0:x}", in(reg) TSS_SEL, options(nostack, preserves_flags));
    }
    crate::log_warn!("GDT: recovered descriptor table from backup");
    check_integrity()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_bytes(e: GdtEntry) -> [u8; 8] {
        unsafe { core::mem::transmute(e) }
    }

    #[test]
    fn kernel_code_descriptor_encoding() {
        // L=1, limit ignored in long mode: 00 00 00 00 00 9A 20 00
        let e = make_entry(0, 0, 0x9A, 0x2);
        assert_eq!(entry_bytes(e), [0x00, 0x00, 0x00, 0x00, 0x00, 0x9A, 0x20, 0x00]);
    }

    #[test]
    fn user_data_descriptor_encoding() {
        // Flat 4 GiB data segment, DPL=3, G=1.
        let e = make_entry(0, 0xFFFFF, 0xF2, 0xC);
        assert_eq!(entry_bytes(e), [0xFF, 0xFF, 0x00, 0x00, 0x00, 0xF2, 0xCF, 0x00]);
    }

    #[test]
    fn user_selectors_carry_rpl3() {
        assert_eq!(USER_CODE_SEL | RPL_USER, 0x1B);
        assert_eq!(USER_DATA_SEL | RPL_USER, 0x23);
    }

    #[test]
    fn tss_layout_is_104_bytes() {
        assert_eq!(size_of::<Tss>(), 104);
    }
}
