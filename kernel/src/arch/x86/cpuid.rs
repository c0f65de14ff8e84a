//! CPU feature detection via CPUID.
//!
//! The only feature the memory manager gates on is NX (no-execute pages):
//! CPUID leaf 0x80000001, EDX bit 20. When the bit is absent, NX mapping
//! flags are silently dropped.

use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

static NX_SUPPORTED: AtomicBool = AtomicBool::new(false);

/// Execute CPUID for the given leaf, returning (EAX, EBX, ECX, EDX).
///
/// RBX is LLVM-reserved in inline assembly, so it is shuffled through a
/// scratch register.
fn cpuid(leaf: u32) -> (u32, u32, u32, u32) {
    let eax: u32;
    let ebx: u32;
    let ecx: u32;
    let edx: u32;
    unsafe {
        asm!(
            "mov {tmp:e}, ebx",
            "cpuid",
            "xchg {tmp:e}, ebx",
            tmp = out(reg) ebx,
            inout("eax") leaf => eax,
            out("ecx") ecx,
            out("edx") edx,
            options(nomem, nostack, preserves_flags),
        );
    }
    (eax, ebx, ecx, edx)
}

/// Probe extended feature leaves once at boot.
pub fn detect() {
    let (max_ext, _, _, _) = cpuid(0x8000_0000);
    if max_ext >= 0x8000_0001 {
        let (_, _, _, edx) = cpuid(0x8000_0001);
        NX_SUPPORTED.store(edx & (1 << 20) != 0, Ordering::Release);
    }
    crate::log_info!(
        "CPU: NX bit {}",
        if nx_supported() { "supported" } else { "not supported" }
    );
}

/// Whether the CPU honors the NX bit on page-table entries.
pub fn nx_supported() -> bool {
    NX_SUPPORTED.load(Ordering::Acquire)
}
