//! Virtual memory areas: a stop-gap allocator over fixed arenas.
//!
//! Two static pools (kernel and user) of fixed-size arenas, each a
//! `{base, length, flags, in-use}` tuple. `allocate` picks the first unused
//! arena whose flags match, backs it with fresh frames, maps and zero-fills
//! them; `free` unmaps and returns the arena to the pool. No splitting, no
//! coalescing.

use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::{physical, virtual_mem, FRAME_SIZE};
use crate::sync::spinlock::Spinlock;

/// Arenas per pool.
const ARENAS_PER_POOL: usize = 4;

/// Size of each fixed arena.
const ARENA_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB

/// Kernel arenas live in an otherwise unused upper-half window, clear of
/// the direct map and the kernel image.
const KERNEL_ARENA_BASE: u64 = 0xFFFF_9000_0000_0000;

/// User arenas sit above the typical executable load region.
const USER_ARENA_BASE: u64 = 0x0000_0000_4000_0000;

/// The direct map is assumed to cover at least the first 4 GiB of physical
/// memory; `map_physical` answers requests below this line straight from it.
const DIRECT_MAP_LIMIT: u64 = 0x1_0000_0000;

/// One reserved virtual range.
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    pub base: u64,
    pub length: u64,
    pub flags: u64,
    pub in_use: bool,
}

const EMPTY_ARENA: Arena = Arena { base: 0, length: 0, flags: 0, in_use: false };

/// A fixed pool of arenas. Pure bookkeeping; mapping is the caller's job.
pub struct ArenaPool {
    arenas: [Arena; ARENAS_PER_POOL],
    count: usize,
}

impl ArenaPool {
    pub const fn new() -> Self {
        ArenaPool { arenas: [EMPTY_ARENA; ARENAS_PER_POOL], count: 0 }
    }

    /// Register one arena. Silently ignored when the pool is full.
    pub fn register(&mut self, base: u64, length: u64, flags: u64) {
        if self.count == ARENAS_PER_POOL {
            crate::log_error!("VMM: arena pool full, dropping {:#x}", base);
            return;
        }
        self.arenas[self.count] = Arena { base, length, flags, in_use: false };
        self.count += 1;
    }

    /// Claim the first unused arena that can hold `size` bytes. Returns its
    /// base address.
    pub fn claim(&mut self, size: u64) -> Option<u64> {
        for arena in self.arenas[..self.count].iter_mut() {
            if !arena.in_use && arena.length >= size {
                arena.in_use = true;
                return Some(arena.base);
            }
        }
        None
    }

    /// Return the arena starting at `base` to the pool. Unknown bases are a
    /// no-op; returns whether anything was released.
    pub fn release(&mut self, base: u64) -> bool {
        for arena in self.arenas[..self.count].iter_mut() {
            if arena.base == base && arena.in_use {
                arena.in_use = false;
                return true;
            }
        }
        false
    }

    /// Flags the arena at `base` was registered with.
    pub fn flags_of(&self, base: u64) -> Option<u64> {
        self.arenas[..self.count]
            .iter()
            .find(|a| a.base == base)
            .map(|a| a.flags)
    }
}

static KERNEL_POOL: Spinlock<ArenaPool> = Spinlock::new(ArenaPool::new());
static USER_POOL: Spinlock<ArenaPool> = Spinlock::new(ArenaPool::new());

/// Register the fixed kernel and user arenas. Called once from VMM init.
pub fn init() {
    let mut kernel = KERNEL_POOL.lock();
    let mut user = USER_POOL.lock();
    for i in 0..ARENAS_PER_POOL as u64 {
        kernel.register(
            KERNEL_ARENA_BASE + i * ARENA_SIZE,
            ARENA_SIZE,
            virtual_mem::FLAG_WRITABLE,
        );
        user.register(
            USER_ARENA_BASE + i * ARENA_SIZE,
            ARENA_SIZE,
            virtual_mem::FLAG_WRITABLE | virtual_mem::FLAG_USER,
        );
    }
    drop(kernel);
    drop(user);

    // Force the kernel arenas' upper-half PML4 entries into existence now:
    // new address spaces share the upper half by copying it at creation
    // time, so every shared entry must exist before the first clone.
    let space = virtual_mem::kernel_space();
    for i in 0..ARENAS_PER_POOL as u64 {
        virtual_mem::map_guard_page_in(
            &space,
            VirtAddr::new(KERNEL_ARENA_BASE + i * ARENA_SIZE),
        );
    }

    crate::log_info!(
        "VMM: {} kernel + {} user arenas of {} MiB",
        ARENAS_PER_POOL,
        ARENAS_PER_POOL,
        ARENA_SIZE / (1024 * 1024)
    );
}

fn round_up(size: usize) -> usize {
    (size + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)
}

/// Allocate `size` bytes (rounded up to whole pages) of virtual memory
/// backed by freshly allocated, zeroed frames.
///
/// Picks the first free arena of the pool selected by `FLAG_USER`. Returns
/// the page-aligned base, or `None` when no arena or no frames are left.
/// Partial failures are fully unwound.
pub fn allocate(size: usize, flags: u64) -> Option<u64> {
    if size == 0 {
        return None;
    }
    let size = round_up(size);
    let pages = size / FRAME_SIZE;

    let pool = if flags & virtual_mem::FLAG_USER != 0 { &USER_POOL } else { &KERNEL_POOL };
    let (base, arena_flags) = {
        let mut guard = pool.lock();
        let base = match guard.claim(size as u64) {
            Some(base) => base,
            None => {
                crate::log_error!("VMM: no free arena for allocation of {} bytes", size);
                return None;
            }
        };
        (base, guard.flags_of(base).unwrap_or(0))
    };
    let combined = flags | arena_flags;

    for i in 0..pages {
        let virt = VirtAddr::new(base + (i * FRAME_SIZE) as u64);
        let phys = match physical::alloc_frame() {
            Some(p) => p,
            None => {
                unwind_allocation(base, i);
                pool.lock().release(base);
                return None;
            }
        };
        if !virtual_mem::map_page(virt, phys, combined) {
            physical::free_frame(phys);
            unwind_allocation(base, i);
            pool.lock().release(base);
            return None;
        }
        unsafe {
            core::ptr::write_bytes(virtual_mem::phys_to_virt(phys), 0, FRAME_SIZE);
        }
    }

    Some(base)
}

/// Undo the first `pages` pages of a partially built allocation.
fn unwind_allocation(base: u64, pages: usize) {
    for j in 0..pages {
        let virt = VirtAddr::new(base + (j * FRAME_SIZE) as u64);
        if let Some(phys) = virtual_mem::translate(virt) {
            virtual_mem::unmap_page(virt);
            physical::free_frame(PhysAddr::new(phys));
        }
    }
}

/// Free an allocation made by [`allocate`]: unmap every page, return the
/// backing frames, release the arena. Freeing a base that was never
/// allocated is a no-op.
pub fn free(base: u64, size: usize) {
    if base == 0 || size == 0 {
        return;
    }
    let pool = if VirtAddr::new(base).is_user() { &USER_POOL } else { &KERNEL_POOL };
    if !pool.lock().release(base) {
        crate::log_warn!("VMM: ignoring free of unallocated arena {:#x}", base);
        return;
    }

    let pages = round_up(size) / FRAME_SIZE;
    for i in 0..pages {
        let virt = VirtAddr::new(base + (i * FRAME_SIZE) as u64);
        if let Some(phys) = virtual_mem::translate(virt) {
            virtual_mem::unmap_page(virt);
            physical::free_frame(PhysAddr::new(phys));
        }
    }
}

/// Map a physical range (MMIO or high memory) into kernel virtual space.
///
/// Physical addresses below 4 GiB are answered straight from the direct map
/// without consulting `flags`; higher ranges claim a kernel arena and map
/// page by page.
pub fn map_physical(phys: PhysAddr, size: usize, flags: u64) -> Option<u64> {
    if phys.as_u64() == 0 || size == 0 {
        return None;
    }
    let size = round_up(size);

    if phys.as_u64() < DIRECT_MAP_LIMIT {
        return Some(virtual_mem::phys_to_virt(phys) as u64);
    }

    let base = {
        let mut guard = KERNEL_POOL.lock();
        guard.claim(size as u64)?
    };

    let pages = size / FRAME_SIZE;
    for i in 0..pages {
        let virt = VirtAddr::new(base + (i * FRAME_SIZE) as u64);
        let frame = PhysAddr::new(phys.as_u64() + (i * FRAME_SIZE) as u64);
        if !virtual_mem::map_page(virt, frame, flags) {
            virtual_mem::unmap_pages(VirtAddr::new(base), i);
            KERNEL_POOL.lock().release(base);
            return None;
        }
    }
    Some(base)
}

/// Unmap a range returned by [`map_physical`]. Direct-map pointers are left
/// alone; arena mappings are unmapped and their arena released.
pub fn unmap_physical(virt: u64, size: usize) {
    if virt == 0 || size == 0 {
        return;
    }
    let hhdm = virtual_mem::hhdm_offset();
    if virt >= hhdm && virt < hhdm + DIRECT_MAP_LIMIT {
        return;
    }

    let pages = round_up(size) / FRAME_SIZE;
    virtual_mem::unmap_pages(VirtAddr::new(virt), pages);
    KERNEL_POOL.lock().release(virt);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_two() -> ArenaPool {
        let mut pool = ArenaPool::new();
        pool.register(0x1000_0000, ARENA_SIZE, 0x1);
        pool.register(0x1100_0000, ARENA_SIZE, 0x1);
        pool
    }

    #[test]
    fn claim_picks_first_free_arena() {
        let mut pool = pool_with_two();
        assert_eq!(pool.claim(4096), Some(0x1000_0000));
        assert_eq!(pool.claim(4096), Some(0x1100_0000));
        assert_eq!(pool.claim(4096), None);
    }

    #[test]
    fn claim_respects_size() {
        let mut pool = pool_with_two();
        assert_eq!(pool.claim(ARENA_SIZE as u64 + 1), None);
        assert_eq!(pool.claim(ARENA_SIZE as u64), Some(0x1000_0000));
    }

    #[test]
    fn release_returns_arena_for_reuse() {
        let mut pool = pool_with_two();
        let a = pool.claim(4096).unwrap();
        assert!(pool.release(a));
        assert_eq!(pool.claim(4096), Some(a));
    }

    #[test]
    fn release_of_unknown_base_is_noop() {
        let mut pool = pool_with_two();
        assert!(!pool.release(0xDEAD_0000));
        // Releasing an arena that is not in use is also a no-op.
        assert!(!pool.release(0x1000_0000));
    }

    #[test]
    fn size_rounding_is_whole_pages() {
        assert_eq!(round_up(1), FRAME_SIZE);
        assert_eq!(round_up(FRAME_SIZE), FRAME_SIZE);
        assert_eq!(round_up(FRAME_SIZE + 1), 2 * FRAME_SIZE);
    }

    #[test]
    fn pool_capacity_is_bounded() {
        let mut pool = ArenaPool::new();
        for i in 0..(ARENAS_PER_POOL as u64 + 2) {
            pool.register(0x1000_0000 + i * ARENA_SIZE, ARENA_SIZE, 0);
        }
        // Only the first ARENAS_PER_POOL registrations stick.
        let mut claimed = 0;
        while pool.claim(4096).is_some() {
            claimed += 1;
        }
        assert_eq!(claimed, ARENAS_PER_POOL);
    }
}
