//! Cascaded 8259 PIC driver.
//!
//! Grounded in the teacher's `interrupts.rs`, which wraps the `pic8259`
//! crate's `ChainedPics` the same way; the vector offsets below match
//! `i8259.c`'s `ICW2_MASTER`/`ICW2_SLAVE` (0x20/0x28), so hardware IRQ 0
//! (PIT) lands at IDT vector 0x20 and IRQ 1 (keyboard) at 0x21, leaving
//! 0x00-0x1F for CPU exceptions as `init_idt.c` expects.

use pic8259::ChainedPics;
use spin::Mutex;

/// IDT vector of the master PIC's first line (IRQ 0 / PIT).
pub const PIC_1_OFFSET: u8 = 0x20;
/// IDT vector of the slave PIC's first line (IRQ 8 / RTC).
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Interrupt vectors the kernel actually wires up.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    /// Programmable interval timer, IRQ 0.
    Pit = PIC_1_OFFSET,
    /// Keyboard controller, IRQ 1.
    Keyboard = PIC_1_OFFSET + 1,
    /// Real-time clock, IRQ 8.
    Rtc = PIC_2_OFFSET,
}

impl InterruptIndex {
    /// This vector as a raw `u8`.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The chained master/slave PIC pair.
///
/// # Safety
/// The offsets must not overlap the CPU exception range (0x00-0x1F), which
/// they don't: 0x20 and 0x28 both fall safely above it.
pub static PICS: Mutex<ChainedPics> =
    unsafe { Mutex::new(ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET)) };

/// Initialize both PICs and mask every line.
///
/// Matches `i8259_init()`: both PICs receive ICW1/ICW2/ICW3/ICW4, then every
/// IRQ is masked except the slave's cascade line (IRQ 2), which the slave
/// PIC is physically wired through.
///
/// # Safety
/// Must run once, with interrupts disabled, before any IRQ line is
/// unmasked via [`enable_irq`].
pub unsafe fn init() {
    // SAFETY: runs once at boot before any IRQ is unmasked, per this
    // function's own safety contract.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Send an end-of-interrupt for `vector`.
///
/// # Safety
/// Must be called from the handler that serviced `vector`, after the work
/// that needs interrupts held off is done, matching `send_eoi()`'s contract.
pub unsafe fn send_eoi(vector: u8) {
    // SAFETY: caller handled the interrupt this vector corresponds to.
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}
