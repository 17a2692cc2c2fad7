//! # Legacy 8259 Shutdown
//!
//! Machines that still wire up the dual 8259s have them firing at the
//! CPU-exception vector range after reset. Before the I/O APIC takes
//! over, both chips get the full ICW1-ICW4 remap to vectors 0x20/0x28 and
//! then every line masked. Remap-then-mask matters: a masked PIC can
//! still deliver a spurious interrupt, and it must arrive at a sane
//! vector when it does.

use crate::arch::x86_64::core::ports::{inb, io_wait, outb};

/// Master PIC command/data ports.
const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;

/// Slave PIC command/data ports.
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

/// ICW1: edge-triggered, cascade, ICW4 follows.
const ICW1_INIT: u8 = 0x11;

/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;

/// Vector base for the master PIC after remap.
pub const MASTER_VECTOR_BASE: u8 = 0x20;

/// Vector base for the slave PIC after remap.
pub const SLAVE_VECTOR_BASE: u8 = 0x28;

/// Remap both 8259s onto 0x20/0x28 and mask every line.
///
/// # Safety
///
/// Ring 0, interrupts disabled. Only call when the topology reports
/// legacy PICs; the port pokes float on hardware without them.
pub unsafe fn disable() {
    unsafe {
        // Preserve nothing: the chips are being parked, not shared.
        let _ = inb(MASTER_DATA);
        let _ = inb(SLAVE_DATA);

        // ICW1: start initialization on both chips.
        outb(MASTER_CMD, ICW1_INIT);
        io_wait();
        outb(SLAVE_CMD, ICW1_INIT);
        io_wait();

        // ICW2: vector bases.
        outb(MASTER_DATA, MASTER_VECTOR_BASE);
        io_wait();
        outb(SLAVE_DATA, SLAVE_VECTOR_BASE);
        io_wait();

        // ICW3: slave on master line 2, slave identity 2.
        outb(MASTER_DATA, 0x04);
        io_wait();
        outb(SLAVE_DATA, 0x02);
        io_wait();

        // ICW4: 8086 mode.
        outb(MASTER_DATA, ICW4_8086);
        io_wait();
        outb(SLAVE_DATA, ICW4_8086);
        io_wait();

        // Mask everything.
        outb(MASTER_DATA, 0xFF);
        outb(SLAVE_DATA, 0xFF);
    }

    log::info!("pic: 8259s remapped to {MASTER_VECTOR_BASE:#x}/{SLAVE_VECTOR_BASE:#x} and masked");
}
