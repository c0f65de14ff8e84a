#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![allow(dead_code, static_mut_refs)]
//! Kernel entry point and initialization sequence.
//!
//! Brings the machine from the boot handoff to the idle loop: serial
//! logging, descriptor tables, interrupt dispatch, physical and virtual
//! memory, then the scheduler. Steady state is timer-driven preemption
//! over the task table with this boot context as the idle task.

mod arch;
mod boot_info;
mod drivers;
mod fs;
#[cfg(feature = "ktest")]
mod ktest;
mod logging;
mod memory;
mod panic;
mod sync;
mod task;

use boot_info::BootInfo;
use task::scheduler;

/// Kernel entry point, called by the boot stage with a pointer to the
/// [`BootInfo`] block.
#[cfg(not(test))]
#[no_mangle]
pub extern "C" fn kernel_main(boot_info_addr: u64) -> ! {
    // Phase 1: early output
    drivers::serial::init();
    logging::init(logging::LogLevel::Debug);
    serial_println!("");
    serial_println!("  Vesper kernel v0.1");
    serial_println!("");

    let boot_info = unsafe { &*(boot_info_addr as *const BootInfo) };
    if !boot_info.validate() {
        log_warn!("BootInfo magic mismatch (got {:#x})", boot_info.magic);
    }

    // Phase 2: CPU setup
    arch::x86::gdt::init();
    log_info!("GDT and TSS initialized");

    arch::x86::idt::init();
    log_info!("IDT initialized (256 entries, IRQ 0-15 -> INT 32-47)");

    arch::x86::cpuid::detect();

    // Phase 3: memory
    let memory_map = unsafe { boot_info.memory_map() };
    memory::physical::init(memory_map);
    memory::virtual_mem::init(boot_info);

    // Phase 4: framebuffer handoff (blank it; drawing belongs to userland)
    clear_framebuffer(boot_info);

    // Phase 5: scheduling
    scheduler::init(scheduler::DEFAULT_QUANTUM, scheduler::TICK_RATE);
    scheduler::register_idle();

    log_info!("Enabling interrupts");
    arch::x86::idt::enable();

    if !arch::x86::gdt::check_integrity() || !arch::x86::idt::check_integrity() {
        log_error!("Descriptor table integrity check failed after init");
    }

    #[cfg(feature = "ktest")]
    ktest::run_all();

    boot_summary(boot_info);
    log_info!("Kernel initialized");

    // Idle loop: task 0. The scheduler takes the CPU away whenever real
    // work is ready and hands it back when the queue drains.
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
    }
}

/// Blank the boot framebuffer through the physical-mapping path.
#[cfg(not(test))]
fn clear_framebuffer(boot_info: &BootInfo) {
    let fb = &boot_info.framebuffer;
    if fb.addr == 0 || fb.pitch == 0 || fb.height == 0 {
        log_warn!("No framebuffer available");
        return;
    }
    let size = fb.pitch as usize * fb.height as usize;
    let base = memory::vma::map_physical(
        memory::address::PhysAddr::new(fb.addr),
        size,
        memory::virtual_mem::FLAG_WRITABLE | memory::virtual_mem::FLAG_NO_CACHE,
    );
    match base {
        Some(base) => {
            unsafe {
                core::ptr::write_bytes(base as *mut u8, 0, size);
            }
            log_info!(
                "Framebuffer: {}x{}, pitch {}, {} bpp",
                fb.width, fb.height, fb.pitch, fb.bpp
            );
        }
        None => log_warn!("Failed to map framebuffer at {:#x}", fb.addr),
    }
}

/// One-shot report of what init produced.
#[cfg(not(test))]
fn boot_summary(boot_info: &BootInfo) {
    log_info!(
        "Memory: {} MiB free of {} MiB managed",
        memory::physical::free_memory() / (1024 * 1024),
        (memory::physical::total_frame_count() * memory::FRAME_SIZE) / (1024 * 1024)
    );
    memory::physical::dump_stats();
    log_info!(
        "Kernel image: phys {:#x}, virt {:#x}",
        boot_info.kernel_phys_base, boot_info.kernel_virt_base
    );
    let stats = scheduler::stats();
    log_info!(
        "Scheduler: {} tasks, tick rate {} Hz",
        stats.current_task_count,
        arch::x86::pit::tick_hz()
    );
}
