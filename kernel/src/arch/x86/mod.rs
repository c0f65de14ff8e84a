//! x86-64 CPU setup: descriptor tables, interrupts, timer, feature probes.

pub mod cpuid;
pub mod gdt;
pub mod idt;
pub mod isr;
pub mod msr;
pub mod pic;
pub mod pit;
pub mod port;
pub mod switch;
