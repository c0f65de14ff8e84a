//! 8254 Programmable Interval Timer: the kernel's tick source.
//!
//! Channel 0 runs in square-wave mode at the configured frequency (100 Hz
//! by default; the scheduler reprograms it to 1000 Hz). A single registered
//! callback receives the tick count on every timer interrupt; the scheduler
//! installs itself there.

use crate::arch::x86::port::outb;
use crate::arch::x86::{idt, pic};
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const PIT_CHANNEL0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
/// Base oscillator frequency of the 8254 in Hz.
const PIT_FREQUENCY: u32 = 1_193_182;

/// Default tick rate when no one reconfigures the timer.
pub const DEFAULT_HZ: u32 = 100;

/// IRQ line / interrupt vector of the timer.
const TIMER_IRQ: u8 = 0;
const TIMER_VECTOR: u8 = 32;

/// Monotonically increasing tick counter.
static TICK_COUNT: AtomicU64 = AtomicU64::new(0);

/// Configured tick rate in Hz.
static TICK_HZ: AtomicU32 = AtomicU32::new(DEFAULT_HZ);

/// The lone tick callback (the scheduler). Stored as a raw fn pointer; only
/// written at init time.
static mut TICK_CALLBACK: Option<fn(u64)> = None;

/// Program channel 0 to fire `frequency` times per second and unmask IRQ 0.
pub fn init(frequency: u32) {
    crate::log_info!("Timer: programming PIT at {} Hz", frequency);
    set_frequency(frequency);
    idt::register_handler(TIMER_VECTOR, timer_interrupt);
    pic::unmask(TIMER_IRQ);
}

/// Reprogram the PIT divisor.
pub fn set_frequency(frequency: u32) {
    let divisor = PIT_FREQUENCY / frequency;
    TICK_HZ.store(frequency, Ordering::Relaxed);
    unsafe {
        // Channel 0, lobyte/hibyte access, mode 3 (square wave), binary
        outb(PIT_CMD, 0x36);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, ((divisor >> 8) & 0xFF) as u8);
    }
}

/// Install the tick callback. One slot; the last registration wins.
pub fn register_callback(callback: fn(u64)) {
    unsafe {
        TICK_CALLBACK = Some(callback);
    }
}

/// Current tick count since boot.
pub fn get_ticks() -> u64 {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Configured tick rate in Hz.
pub fn tick_hz() -> u32 {
    TICK_HZ.load(Ordering::Relaxed)
}

/// Milliseconds per tick at the current rate.
fn tick_ms() -> u64 {
    (1000 / TICK_HZ.load(Ordering::Relaxed).max(1)) as u64
}

/// Convert a millisecond delay into a tick count (at least one tick).
pub fn ms_to_ticks(ms: u64) -> u64 {
    (ms / tick_ms().max(1)).max(1)
}

/// Sleep until `ticks >= now + ms/tick_ms`, halting between interrupts.
pub fn sleep_ms(ms: u64) {
    let target = get_ticks() + ms_to_ticks(ms);
    while get_ticks() < target {
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
    }
}

/// Timer interrupt handler (vector 32): bump the counter, fan out to the
/// registered callback.
fn timer_interrupt(_frame: &mut idt::InterruptFrame) {
    let ticks = TICK_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
    let callback = unsafe { TICK_CALLBACK };
    if let Some(callback) = callback {
        callback(ticks);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion_uses_configured_rate() {
        TICK_HZ.store(100, Ordering::Relaxed);
        assert_eq!(ms_to_ticks(100), 10); // 10 ms per tick
        TICK_HZ.store(1000, Ordering::Relaxed);
        assert_eq!(ms_to_ticks(100), 100); // 1 ms per tick
        // Sub-tick sleeps still wait at least one tick.
        assert_eq!(ms_to_ticks(0), 1);
    }
}
