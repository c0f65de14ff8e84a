//! Device drivers owned by the kernel core.
//!
//! Only the serial transmit path lives here; keyboard, mouse, disk, and PCI
//! drivers are external collaborators.

pub mod serial;
