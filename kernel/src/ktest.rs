//! In-kernel self tests, run during boot when the `ktest` feature is on.
//!
//! These exercise the live paging and allocation paths that host unit tests
//! cannot reach. Results go to the serial log; a failure panics.

use crate::memory::address::{PhysAddr, VirtAddr};
use crate::memory::{physical, virtual_mem, vma, FRAME_SIZE};

/// Scratch virtual address in an otherwise unused upper-half window.
const SCRATCH_VIRT: u64 = 0xFFFF_A000_0000_0000;

pub fn run_all() {
    crate::serial_println!("[ktest] running kernel self tests");

    test_map_translate_unmap_round_trip();
    test_alloc_free_conserves_frames();
    test_address_space_create_delete_leaks_nothing();
    test_arena_allocate_free();
    test_null_page_rejected();

    crate::serial_println!("[ktest] all kernel self tests passed");
}

fn test_map_translate_unmap_round_trip() {
    let virt = VirtAddr::new(SCRATCH_VIRT);
    let phys = physical::alloc_frame().expect("no frame");

    assert!(virtual_mem::map_page(virt, phys, virtual_mem::FLAG_WRITABLE));
    assert!(virtual_mem::is_mapped(virt));
    assert_eq!(virtual_mem::translate(virt), Some(phys.as_u64()));

    // The mapping is usable memory.
    unsafe {
        let p = SCRATCH_VIRT as *mut u64;
        p.write_volatile(0xA5A5_5A5A_DEAD_F00D);
        assert_eq!(p.read_volatile(), 0xA5A5_5A5A_DEAD_F00D);
    }

    assert!(virtual_mem::unmap_page(virt));
    assert!(!virtual_mem::is_mapped(virt));
    physical::free_frame(phys);
    crate::serial_println!("[ktest] map/translate/unmap round trip... ok");
}

fn test_alloc_free_conserves_frames() {
    let before = physical::free_frame_count();
    let run = physical::alloc_frames(16).expect("no run");
    assert_eq!(physical::free_frame_count(), before - 16);
    assert!(!physical::is_frame_free(run));
    physical::free_frames(run, 16);
    assert_eq!(physical::free_frame_count(), before);
    assert!(physical::is_frame_free(run));
    crate::serial_println!("[ktest] frame alloc/free conservation... ok");
}

fn test_address_space_create_delete_leaks_nothing() {
    let before = physical::free_frame_count();
    let space = virtual_mem::create_address_space().expect("no space");

    // Populate a little of the lower half so deletion has tables to walk.
    let frame = physical::alloc_frame().expect("no frame");
    assert!(virtual_mem::map_page_in(
        &space,
        VirtAddr::new(0x40_0000),
        frame,
        virtual_mem::FLAG_WRITABLE | virtual_mem::FLAG_USER,
    ));
    assert!(virtual_mem::is_mapped_in(&space, VirtAddr::new(0x40_0000)));

    physical::free_frame(frame);
    virtual_mem::delete_address_space(space);
    assert_eq!(physical::free_frame_count(), before);
    crate::serial_println!("[ktest] address space create/delete conservation... ok");
}

fn test_arena_allocate_free() {
    let before = physical::free_frame_count();
    let base = vma::allocate(3 * FRAME_SIZE, virtual_mem::FLAG_WRITABLE).expect("no arena");
    assert_eq!(base % FRAME_SIZE as u64, 0);

    // Zero-filled and writable.
    unsafe {
        let p = base as *mut u64;
        assert_eq!(p.read_volatile(), 0);
        p.write_volatile(42);
    }

    vma::free(base, 3 * FRAME_SIZE);
    assert_eq!(physical::free_frame_count(), before);

    // Freeing again is a harmless no-op.
    vma::free(base, 3 * FRAME_SIZE);
    crate::serial_println!("[ktest] arena allocate/free... ok");
}

fn test_null_page_rejected() {
    let phys = PhysAddr::new(0x10_0000);
    assert!(!virtual_mem::map_page(VirtAddr::new(0), phys, virtual_mem::FLAG_WRITABLE));
    crate::serial_println!("[ktest] null page mapping rejected... ok");
}
