//! Virtual memory manager: four-level x86-64 paging over the higher-half
//! direct map.
//!
//! The boot stage maps all physical RAM at a fixed virtual offset, so
//! `phys + hhdm_offset` is the kernel-visible pointer to any frame and page
//! tables of *any* address space can be edited without touching CR3.
//!
//! Kernel space: PML4[256..512] (upper canonical half), shared by every
//! address space. User space: PML4[0..256], private per task.

use crate::arch::x86::{cpuid, idt};
use crate::boot_info::BootInfo;
use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::{physical, FRAME_SIZE, LARGE_PAGE_SIZE};
use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering};

// Hardware page-table entry bits.
const PAGE_PRESENT: u64 = 1 << 0;
const PAGE_WRITABLE: u64 = 1 << 1;
const PAGE_USER: u64 = 1 << 2;
const PAGE_WRITETHROUGH: u64 = 1 << 3;
const PAGE_CACHE_DISABLE: u64 = 1 << 4;
const PAGE_HUGE: u64 = 1 << 7;
const PAGE_GLOBAL: u64 = 1 << 8;
const PAGE_NO_EXECUTE: u64 = 1 << 63;

/// Mask extracting the 40-bit physical frame index (bits 12..51).
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

const ENTRIES_PER_TABLE: usize = 512;

// Mapping flags accepted by the public API. Present is implied on every map.
pub const FLAG_WRITABLE: u64 = 1 << 0;
pub const FLAG_USER: u64 = 1 << 1;
pub const FLAG_WRITETHROUGH: u64 = 1 << 2;
pub const FLAG_NO_CACHE: u64 = 1 << 3;
pub const FLAG_GLOBAL: u64 = 1 << 4;
pub const FLAG_NO_EXECUTE: u64 = 1 << 5;

/// A handle to one address space: the physical address of its top-level
/// table plus the direct-map pointer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace {
    pml4_phys: PhysAddr,
    pml4_virt: *mut u64,
}

// The raw table pointer is derived from the physical address; the handle is
// freely shareable between contexts.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    fn from_phys(pml4_phys: PhysAddr) -> Self {
        AddressSpace {
            pml4_phys,
            pml4_virt: phys_to_virt(pml4_phys) as *mut u64,
        }
    }

    /// Rebuild a handle from a stored CR3 value.
    pub fn from_cr3(cr3: u64) -> Self {
        AddressSpace::from_phys(PhysAddr::new(cr3 & ADDR_MASK))
    }

    /// Physical address of the PML4, i.e. the CR3 value.
    pub fn cr3(&self) -> u64 {
        self.pml4_phys.as_u64()
    }

    fn table(&self) -> *mut u64 {
        self.pml4_virt
    }
}

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
/// Highest physical address covered by the direct map (the top of the boot
/// memory map). Virtual addresses past `hhdm + span` are NOT direct-map
/// addresses even though they sit above the offset.
static DIRECT_MAP_SPAN: AtomicU64 = AtomicU64::new(0);
static KERNEL_PML4: AtomicU64 = AtomicU64::new(0);
static CURRENT_PML4: AtomicU64 = AtomicU64::new(0);

static PAGES_MAPPED: AtomicU64 = AtomicU64::new(0);
static PAGES_UNMAPPED: AtomicU64 = AtomicU64::new(0);

/// Direct-map offset installed by the boot stage.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Relaxed)
}

/// Kernel-visible pointer for a physical address.
///
/// Defined only for addresses reachable through the direct map.
pub fn phys_to_virt(phys: PhysAddr) -> *mut u8 {
    (phys.as_u64() + hhdm_offset()) as *mut u8
}

#[inline]
fn read_cr3() -> u64 {
    let cr3: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

#[inline]
fn write_cr3(cr3: u64) {
    unsafe {
        asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

#[inline]
fn invlpg(virt: u64) {
    unsafe {
        asm!("invlpg [{}]", in(reg) virt, options(nostack, preserves_flags));
    }
}

/// Translate abstract mapping flags into hardware PTE bits.
///
/// NX is honored only when the CPU supports it; otherwise the bit is
/// silently dropped.
fn hw_flags(flags: u64, nx_supported: bool) -> u64 {
    let mut hw = PAGE_PRESENT;
    if flags & FLAG_WRITABLE != 0 {
        hw |= PAGE_WRITABLE;
    }
    if flags & FLAG_USER != 0 {
        hw |= PAGE_USER;
    }
    if flags & FLAG_WRITETHROUGH != 0 {
        hw |= PAGE_WRITETHROUGH;
    }
    if flags & FLAG_NO_CACHE != 0 {
        hw |= PAGE_CACHE_DISABLE;
    }
    if flags & FLAG_GLOBAL != 0 {
        hw |= PAGE_GLOBAL;
    }
    if flags & FLAG_NO_EXECUTE != 0 && nx_supported {
        hw |= PAGE_NO_EXECUTE;
    }
    hw
}

/// Initialize the VMM from boot information: record the direct-map offset,
/// adopt the boot page tables as the kernel address space, and claim the
/// page-fault vector.
pub fn init(boot_info: &BootInfo) {
    HHDM_OFFSET.store(boot_info.hhdm_offset, Ordering::Relaxed);

    let mut phys_top: u64 = 0;
    for region in unsafe { boot_info.memory_map() } {
        phys_top = phys_top.max(region.base + region.length);
    }
    DIRECT_MAP_SPAN.store(phys_top, Ordering::Relaxed);

    let cr3 = read_cr3() & ADDR_MASK;
    KERNEL_PML4.store(cr3, Ordering::Relaxed);
    CURRENT_PML4.store(cr3, Ordering::Relaxed);

    idt::register_handler(14, page_fault_handler);

    crate::log_info!("VMM: HHDM offset {:#x}", boot_info.hhdm_offset);
    crate::log_info!(
        "VMM: kernel at phys {:#x} / virt {:#x}, PML4 {:#x}",
        boot_info.kernel_phys_base,
        boot_info.kernel_virt_base,
        cr3
    );

    crate::memory::vma::init();
}

/// The kernel (boot-time) address space.
pub fn kernel_space() -> AddressSpace {
    AddressSpace::from_phys(PhysAddr::new(KERNEL_PML4.load(Ordering::Relaxed)))
}

/// The currently active address space.
pub fn current_space() -> AddressSpace {
    AddressSpace::from_phys(PhysAddr::new(CURRENT_PML4.load(Ordering::Relaxed)))
}

/// Allocate and zero a new page-table frame, returning its physical address.
fn create_table() -> Option<PhysAddr> {
    let frame = physical::alloc_frame()?;
    unsafe {
        core::ptr::write_bytes(phys_to_virt(frame), 0, FRAME_SIZE);
    }
    Some(frame)
}

/// Ensure the entry at `index` in `table` points at a child table, creating
/// one on first use. New interior tables are present + writable, and
/// additionally user-accessible when the target address is in the lower
/// half. Returns the child table pointer, or `None` on frame exhaustion.
fn ensure_table(table: *mut u64, index: usize, user: bool) -> Option<*mut u64> {
    unsafe {
        let entry = table.add(index).read_volatile();
        if entry & PAGE_PRESENT != 0 {
            return Some(phys_to_virt(PhysAddr::new(entry & ADDR_MASK)) as *mut u64);
        }

        let child = create_table()?;
        let mut flags = PAGE_PRESENT | PAGE_WRITABLE;
        if user {
            flags |= PAGE_USER;
        }
        table.add(index).write_volatile(child.as_u64() | flags);
        Some(phys_to_virt(child) as *mut u64)
    }
}

/// Map one 4 KiB page in the given address space.
///
/// Rejects the null page and null frames. An existing mapping is
/// overwritten with a warning.
pub fn map_page_in(space: &AddressSpace, virt: VirtAddr, phys: PhysAddr, flags: u64) -> bool {
    if virt.page_align_down().as_u64() == 0 {
        crate::log_error!("VMM: refusing to map the null page");
        return false;
    }
    if phys.frame_align_down().as_u64() == 0 {
        crate::log_error!("VMM: refusing to map the null frame");
        return false;
    }

    let virt = virt.page_align_down();
    let phys = phys.frame_align_down();
    let user = virt.is_user();
    let hw = hw_flags(flags, cpuid::nx_supported());

    let pml4 = space.table();
    let pdpt = match ensure_table(pml4, virt.pml4_index(), user) {
        Some(t) => t,
        None => {
            crate::log_error!("VMM: failed to allocate PDPT for {:#x}", virt.as_u64());
            return false;
        }
    };
    let pd = match ensure_table(pdpt, virt.pdpt_index(), user) {
        Some(t) => t,
        None => {
            crate::log_error!("VMM: failed to allocate PD for {:#x}", virt.as_u64());
            return false;
        }
    };
    let pt = match ensure_table(pd, virt.pd_index(), user) {
        Some(t) => t,
        None => {
            crate::log_error!("VMM: failed to allocate PT for {:#x}", virt.as_u64());
            return false;
        }
    };

    unsafe {
        let slot = pt.add(virt.pt_index());
        let old = slot.read_volatile();
        if old & PAGE_PRESENT != 0 {
            crate::log_warn!(
                "VMM: {:#x} already mapped to {:#x}, overwriting",
                virt.as_u64(),
                old & ADDR_MASK
            );
        }
        slot.write_volatile(phys.as_u64() | hw);
    }

    if space.cr3() == CURRENT_PML4.load(Ordering::Relaxed) {
        invlpg(virt.as_u64());
    }
    PAGES_MAPPED.fetch_add(1, Ordering::Relaxed);
    true
}

/// Map one page in the current address space.
pub fn map_page(virt: VirtAddr, phys: PhysAddr, flags: u64) -> bool {
    map_page_in(&current_space(), virt, phys, flags)
}

/// Map one 2 MiB page in the given address space (PD-level entry with the
/// large-page bit).
fn map_large_page_in(space: &AddressSpace, virt: VirtAddr, phys: PhysAddr, flags: u64) -> bool {
    let user = virt.is_user();
    let hw = hw_flags(flags, cpuid::nx_supported()) | PAGE_HUGE;

    let pml4 = space.table();
    let pdpt = match ensure_table(pml4, virt.pml4_index(), user) {
        Some(t) => t,
        None => return false,
    };
    let pd = match ensure_table(pdpt, virt.pdpt_index(), user) {
        Some(t) => t,
        None => return false,
    };

    unsafe {
        pd.add(virt.pd_index()).write_volatile(phys.as_u64() | hw);
    }
    if space.cr3() == CURRENT_PML4.load(Ordering::Relaxed) {
        invlpg(virt.as_u64());
    }
    PAGES_MAPPED.fetch_add(512, Ordering::Relaxed);
    true
}

/// Map `count` pages starting at `virt` → `phys` in the given space.
///
/// When both addresses are 2 MiB aligned and at least a full large page
/// remains, the run is promoted to PD-level large pages. Partial failures
/// unwind everything mapped so far.
pub fn map_pages_in(
    space: &AddressSpace,
    virt: VirtAddr,
    phys: PhysAddr,
    count: usize,
    flags: u64,
) -> bool {
    if count == 0 {
        return false;
    }

    let large_aligned = virt.as_u64() % LARGE_PAGE_SIZE as u64 == 0
        && phys.as_u64() % LARGE_PAGE_SIZE as u64 == 0;

    if large_aligned && count >= ENTRIES_PER_TABLE {
        let huge_pages = count / ENTRIES_PER_TABLE;
        let remaining = count % ENTRIES_PER_TABLE;

        for i in 0..huge_pages {
            let v = VirtAddr::new(virt.as_u64() + (i * LARGE_PAGE_SIZE) as u64);
            let p = PhysAddr::new(phys.as_u64() + (i * LARGE_PAGE_SIZE) as u64);
            if !map_large_page_in(space, v, p, flags) {
                for j in 0..i {
                    unmap_page_in(space, VirtAddr::new(virt.as_u64() + (j * LARGE_PAGE_SIZE) as u64));
                }
                return false;
            }
        }

        let tail_virt = virt.as_u64() + (huge_pages * LARGE_PAGE_SIZE) as u64;
        let tail_phys = phys.as_u64() + (huge_pages * LARGE_PAGE_SIZE) as u64;
        for i in 0..remaining {
            let v = VirtAddr::new(tail_virt + (i * FRAME_SIZE) as u64);
            let p = PhysAddr::new(tail_phys + (i * FRAME_SIZE) as u64);
            if !map_page_in(space, v, p, flags) {
                for j in 0..i {
                    unmap_page_in(space, VirtAddr::new(tail_virt + (j * FRAME_SIZE) as u64));
                }
                for j in 0..huge_pages {
                    unmap_page_in(space, VirtAddr::new(virt.as_u64() + (j * LARGE_PAGE_SIZE) as u64));
                }
                return false;
            }
        }
        return true;
    }

    for i in 0..count {
        let v = VirtAddr::new(virt.as_u64() + (i * FRAME_SIZE) as u64);
        let p = PhysAddr::new(phys.as_u64() + (i * FRAME_SIZE) as u64);
        if !map_page_in(space, v, p, flags) {
            for j in 0..i {
                unmap_page_in(space, VirtAddr::new(virt.as_u64() + (j * FRAME_SIZE) as u64));
            }
            return false;
        }
    }
    true
}

/// Map `count` pages in the current address space.
pub fn map_pages(virt: VirtAddr, phys: PhysAddr, count: usize, flags: u64) -> bool {
    map_pages_in(&current_space(), virt, phys, count, flags)
}

/// Unmap one page (or the large page covering it) in the given space.
///
/// Unmapping an address that is not mapped is a no-op returning `false`.
pub fn unmap_page_in(space: &AddressSpace, virt: VirtAddr) -> bool {
    let virt = virt.page_align_down();
    let current = space.cr3() == CURRENT_PML4.load(Ordering::Relaxed);

    unsafe {
        let pml4 = space.table();
        let pml4e = pml4.add(virt.pml4_index()).read_volatile();
        if pml4e & PAGE_PRESENT == 0 {
            return false;
        }

        let pdpt = phys_to_virt(PhysAddr::new(pml4e & ADDR_MASK)) as *mut u64;
        let pdpte = pdpt.add(virt.pdpt_index()).read_volatile();
        if pdpte & PAGE_PRESENT == 0 {
            return false;
        }
        if pdpte & PAGE_HUGE != 0 {
            pdpt.add(virt.pdpt_index()).write_volatile(0);
            if current {
                invlpg(virt.as_u64());
            }
            PAGES_UNMAPPED.fetch_add(512 * 512, Ordering::Relaxed);
            return true;
        }

        let pd = phys_to_virt(PhysAddr::new(pdpte & ADDR_MASK)) as *mut u64;
        let pde = pd.add(virt.pd_index()).read_volatile();
        if pde & PAGE_PRESENT == 0 {
            return false;
        }
        if pde & PAGE_HUGE != 0 {
            pd.add(virt.pd_index()).write_volatile(0);
            if current {
                invlpg(virt.as_u64());
            }
            PAGES_UNMAPPED.fetch_add(512, Ordering::Relaxed);
            return true;
        }

        let pt = phys_to_virt(PhysAddr::new(pde & ADDR_MASK)) as *mut u64;
        let pte = pt.add(virt.pt_index()).read_volatile();
        if pte & PAGE_PRESENT == 0 {
            return false;
        }

        pt.add(virt.pt_index()).write_volatile(0);
        if current {
            invlpg(virt.as_u64());
        }
        PAGES_UNMAPPED.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Unmap one page in the current address space.
pub fn unmap_page(virt: VirtAddr) -> bool {
    unmap_page_in(&current_space(), virt)
}

/// Unmap `count` pages starting at `virt` in the given space. Pages that
/// were never mapped are skipped.
pub fn unmap_pages_in(space: &AddressSpace, virt: VirtAddr, count: usize) {
    for i in 0..count {
        unmap_page_in(space, VirtAddr::new(virt.as_u64() + (i * FRAME_SIZE) as u64));
    }
}

/// Unmap `count` pages in the current address space.
pub fn unmap_pages(virt: VirtAddr, count: usize) {
    unmap_pages_in(&current_space(), virt, count)
}

/// Walk the tables of `space` and translate `virt` to its backing physical
/// address, honoring 1 GiB and 2 MiB large pages.
pub fn translate_in(space: &AddressSpace, virt: VirtAddr) -> Option<u64> {
    let raw = virt.as_u64();
    let hhdm = hhdm_offset();
    let span = DIRECT_MAP_SPAN.load(Ordering::Relaxed);
    if hhdm != 0 && raw >= hhdm && raw - hhdm < span {
        // Inside the direct-map window: translate by offset subtraction.
        // Upper-half addresses past the window (kernel arenas, scratch
        // mappings) are table-backed like anything else and fall through
        // to the walk.
        return Some(raw - hhdm);
    }

    unsafe {
        let pml4 = space.table();
        let pml4e = pml4.add(virt.pml4_index()).read_volatile();
        if pml4e & PAGE_PRESENT == 0 {
            return None;
        }

        let pdpt = phys_to_virt(PhysAddr::new(pml4e & ADDR_MASK)) as *const u64;
        let pdpte = pdpt.add(virt.pdpt_index()).read_volatile();
        if pdpte & PAGE_PRESENT == 0 {
            return None;
        }
        if pdpte & PAGE_HUGE != 0 {
            return Some((pdpte & ADDR_MASK) + (raw & 0x3FFF_FFFF));
        }

        let pd = phys_to_virt(PhysAddr::new(pdpte & ADDR_MASK)) as *const u64;
        let pde = pd.add(virt.pd_index()).read_volatile();
        if pde & PAGE_PRESENT == 0 {
            return None;
        }
        if pde & PAGE_HUGE != 0 {
            return Some((pde & ADDR_MASK) + (raw & 0x1F_FFFF));
        }

        let pt = phys_to_virt(PhysAddr::new(pde & ADDR_MASK)) as *const u64;
        let pte = pt.add(virt.pt_index()).read_volatile();
        if pte & PAGE_PRESENT == 0 {
            return None;
        }
        Some((pte & ADDR_MASK) + (raw & 0xFFF))
    }
}

/// Translate in the current address space.
pub fn translate(virt: VirtAddr) -> Option<u64> {
    translate_in(&current_space(), virt)
}

/// Whether `virt` has a present leaf entry in the given space.
pub fn is_mapped_in(space: &AddressSpace, virt: VirtAddr) -> bool {
    translate_in(space, virt).is_some()
}

/// Whether `virt` is mapped in the current address space.
pub fn is_mapped(virt: VirtAddr) -> bool {
    is_mapped_in(&current_space(), virt)
}

/// Install an explicit non-present guard entry for `virt`: the interior
/// tables are created but the leaf entry stays zero, so any access faults.
pub fn map_guard_page_in(space: &AddressSpace, virt: VirtAddr) -> bool {
    let virt = virt.page_align_down();
    let user = virt.is_user();
    let pml4 = space.table();
    let pdpt = match ensure_table(pml4, virt.pml4_index(), user) {
        Some(t) => t,
        None => return false,
    };
    let pd = match ensure_table(pdpt, virt.pdpt_index(), user) {
        Some(t) => t,
        None => return false,
    };
    let pt = match ensure_table(pd, virt.pd_index(), user) {
        Some(t) => t,
        None => return false,
    };
    unsafe {
        pt.add(virt.pt_index()).write_volatile(0);
    }
    crate::log_debug!("VMM: guard page at {:#x}", virt.as_u64());
    true
}

/// Create a new address space: fresh PML4 with the upper-half (kernel)
/// entries copied from the current table and an empty lower half.
pub fn create_address_space() -> Option<AddressSpace> {
    let pml4_phys = create_table()?;
    let space = AddressSpace::from_phys(pml4_phys);

    unsafe {
        let src = current_space().table();
        let dst = space.table();
        for i in 256..ENTRIES_PER_TABLE {
            dst.add(i).write_volatile(src.add(i).read_volatile());
        }
    }
    Some(space)
}

/// Delete an address space: walk only the lower half, freeing each child
/// table (never large-page leaves), then free the PML4 itself. The shared
/// upper half is never touched.
///
/// Deleting the active or kernel address space is rejected.
pub fn delete_address_space(space: AddressSpace) {
    let cr3 = space.cr3();
    if cr3 == 0
        || cr3 == CURRENT_PML4.load(Ordering::Relaxed)
        || cr3 == KERNEL_PML4.load(Ordering::Relaxed)
    {
        crate::log_error!("VMM: refusing to delete active address space {:#x}", cr3);
        return;
    }

    unsafe {
        let pml4 = space.table();
        for pml4_idx in 0..256 {
            let pml4e = pml4.add(pml4_idx).read_volatile();
            if pml4e & PAGE_PRESENT == 0 {
                continue;
            }
            let pdpt_phys = PhysAddr::new(pml4e & ADDR_MASK);
            let pdpt = phys_to_virt(pdpt_phys) as *const u64;

            for pdpt_idx in 0..ENTRIES_PER_TABLE {
                let pdpte = pdpt.add(pdpt_idx).read_volatile();
                if pdpte & PAGE_PRESENT == 0 || pdpte & PAGE_HUGE != 0 {
                    continue;
                }
                let pd_phys = PhysAddr::new(pdpte & ADDR_MASK);
                let pd = phys_to_virt(pd_phys) as *const u64;

                for pd_idx in 0..ENTRIES_PER_TABLE {
                    let pde = pd.add(pd_idx).read_volatile();
                    if pde & PAGE_PRESENT == 0 || pde & PAGE_HUGE != 0 {
                        continue;
                    }
                    physical::free_frame(PhysAddr::new(pde & ADDR_MASK));
                }
                physical::free_frame(pd_phys);
            }
            physical::free_frame(pdpt_phys);
        }
    }
    physical::free_frame(space.pml4_phys);
}

/// Switch to another address space by reloading CR3, which implicitly
/// flushes all non-global TLB entries.
pub fn switch_address_space(space: &AddressSpace) {
    let cr3 = space.cr3();
    if cr3 == 0 || cr3 == CURRENT_PML4.load(Ordering::Relaxed) {
        return;
    }
    CURRENT_PML4.store(cr3, Ordering::Relaxed);
    write_cr3(cr3);
}

/// Invalidate the TLB entry for one virtual page.
pub fn flush_tlb_page(virt: VirtAddr) {
    invlpg(virt.as_u64());
}

/// Flush the entire (non-global) TLB by reloading CR3.
pub fn flush_tlb_all() {
    write_cr3(read_cr3());
}

/// Pages mapped/unmapped since boot.
pub fn stats() -> (u64, u64) {
    (
        PAGES_MAPPED.load(Ordering::Relaxed),
        PAGES_UNMAPPED.load(Ordering::Relaxed),
    )
}

/// Page-fault handler (vector 14).
///
/// Decodes CR2 and the error bits into a structured record. There is no
/// demand paging: a user-mode fault halts the offending task, anything else
/// halts the machine.
fn page_fault_handler(frame: &mut idt::InterruptFrame) {
    let fault_addr: u64;
    unsafe {
        asm!("mov {}, cr2", out(reg) fault_addr, options(nomem, nostack, preserves_flags));
    }
    let err = frame.err_code;

    crate::log_error!("PAGE FAULT at {:#018x} (error {:#x})", fault_addr, err);
    crate::log_error!(
        "  present={} write={} user={} reserved={} fetch={}",
        err & 1,
        (err >> 1) & 1,
        (err >> 2) & 1,
        (err >> 3) & 1,
        (err >> 4) & 1
    );
    crate::log_error!(
        "  RIP={:#018x} translated={:#x?}",
        frame.rip,
        translate(VirtAddr::new(fault_addr))
    );

    // Error code bit 2: the fault came from Ring 3.
    if err & (1 << 2) != 0 {
        // Kill the offending task; the rest of the system keeps running.
        crate::task::scheduler::fault_terminate(frame);
    }

    idt::dump_fault(frame);
    crate::log_critical!("Unrecoverable page fault, halting");
    idt::halt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hw_flags_translate_each_bit() {
        let hw = hw_flags(FLAG_WRITABLE | FLAG_USER, true);
        assert_eq!(hw, PAGE_PRESENT | PAGE_WRITABLE | PAGE_USER);

        let hw = hw_flags(FLAG_WRITETHROUGH | FLAG_NO_CACHE | FLAG_GLOBAL, true);
        assert_eq!(
            hw,
            PAGE_PRESENT | PAGE_WRITETHROUGH | PAGE_CACHE_DISABLE | PAGE_GLOBAL
        );
    }

    #[test]
    fn nx_honored_only_when_supported() {
        assert_eq!(
            hw_flags(FLAG_NO_EXECUTE, true),
            PAGE_PRESENT | PAGE_NO_EXECUTE
        );
        // Without CPU support the NX request is silently dropped.
        assert_eq!(hw_flags(FLAG_NO_EXECUTE, false), PAGE_PRESENT);
    }

    #[test]
    fn present_is_always_implied() {
        assert_eq!(hw_flags(0, false) & PAGE_PRESENT, PAGE_PRESENT);
    }

    #[test]
    fn addr_mask_extracts_40_bit_frame() {
        let entry = 0x8000_0012_3456_7867u64; // NX + frame + low flags
        assert_eq!(entry & ADDR_MASK, 0x12_3456_7000);
    }
}
