//! Real-time-clock driver: one hardware interrupt at a fixed rate,
//! virtualized per terminal into an independent divider/counter pair.
//!
//! No RTC source exists in the retrieved reference material; the CMOS
//! register layout and periodic-interrupt programming sequence below follow
//! the standard legacy MC146818 interface spec.md §6 names ("legacy CMOS
//! interface; periodic mode; IRQ 8"), not a ported file.

use crate::arch::{self, Port};
use crate::pic::{self, InterruptIndex};
use crate::terminal;

const CMOS_INDEX_PORT: u16 = 0x70;
const CMOS_DATA_PORT: u16 = 0x71;
const NMI_DISABLE: u8 = 0x80;
const REG_A: u8 = 0x0A;
const REG_B: u8 = 0x0B;
const REG_C: u8 = 0x0C;
const PERIODIC_INTERRUPT_ENABLE: u8 = 0x40;

/// Hardware interrupt frequency, a power of two (spec.md §4.H).
pub const RTC_RATE: u32 = 1024;
/// Rate-select nibble for [`RTC_RATE`]: `32768 >> (rate - 1) == RTC_RATE`.
const RATE_SELECT: u8 = 6;

const MASTER_8259_IMR: u16 = 0x21;
const SLAVE_8259_IMR: u16 = 0xA1;
const CASCADE_IRQ: u8 = 2;
const RTC_IRQ_ON_SLAVE: u8 = 0;

fn cmos_read(reg: u8) -> u8 {
    let index = Port::new(CMOS_INDEX_PORT);
    let data = Port::new(CMOS_DATA_PORT);
    // SAFETY: 0x70/0x71 are the standard CMOS index/data ports.
    unsafe {
        index.write(reg | NMI_DISABLE);
        data.read()
    }
}

fn cmos_write(reg: u8, value: u8) {
    let index = Port::new(CMOS_INDEX_PORT);
    let data = Port::new(CMOS_DATA_PORT);
    // SAFETY: 0x70/0x71 are the standard CMOS index/data ports.
    unsafe {
        index.write(reg | NMI_DISABLE);
        data.write(value);
    }
}

fn unmask_irq_line(port: u16, line: u8) {
    let port = Port::new(port);
    // SAFETY: clears a single mask bit on an already-initialized PIC.
    unsafe {
        let mask = port.read() & !(1 << line);
        port.write(mask);
    }
}

/// Install the RTC interrupt handler in the IDT. Must run before
/// [`arch::idt::load`].
pub fn install_handler() {
    crate::arch::idt::set_handler(
        InterruptIndex::Rtc.as_u8(),
        rtc_interrupt_handler,
        crate::arch::idt::GateType::Interrupt,
        0,
    );
}

extern "x86-interrupt" fn rtc_interrupt_handler(_frame: crate::arch::idt::InterruptStackFrame) {
    // SAFETY: called only from the IDT's RTC vector.
    unsafe {
        rtc_interrupt();
    }
}

/// Program the CMOS RTC for periodic interrupts at [`RTC_RATE`] and unmask
/// its IRQ line (8, via the slave PIC's cascade line 2 on the master).
///
/// # Safety
/// Must run after [`crate::pic::init`] and before interrupts are enabled.
pub unsafe fn init() {
    let prev_b = cmos_read(REG_B);
    cmos_write(REG_B, prev_b | PERIODIC_INTERRUPT_ENABLE);

    let prev_a = cmos_read(REG_A);
    cmos_write(REG_A, (prev_a & 0xF0) | RATE_SELECT);

    unmask_irq_line(MASTER_8259_IMR, CASCADE_IRQ);
    unmask_irq_line(SLAVE_8259_IMR, RTC_IRQ_ON_SLAVE);
}

/// The RTC interrupt handler: advance every terminal's virtual counter, then
/// acknowledge the hardware interrupt and send EOI.
///
/// # Safety
/// Must only be called from the IDT's RTC vector.
pub unsafe fn rtc_interrupt() {
    for index in 0..terminal::MAX_TERMINALS {
        terminal::with_rtc_state(index, |divider, counter, received| {
            *counter += 1;
            if *counter >= *divider {
                *counter = 0;
                *received = true;
            }
        });
    }

    // Reading register C is required to re-arm the next RTC interrupt.
    let _ = cmos_read(REG_C);

    // SAFETY: this IRQ is the one just serviced.
    unsafe {
        pic::send_eoi(InterruptIndex::Rtc.as_u8());
    }
}

/// Reset `terminal_index`'s virtual RTC frequency to 2 Hz, per `rtc_open`.
pub fn rtc_open(terminal_index: usize) -> i32 {
    terminal::with_rtc_state(terminal_index, |divider, counter, received| {
        *divider = RTC_RATE / 2;
        *counter = 0;
        *received = false;
    });
    0
}

/// Set `terminal_index`'s virtual RTC frequency. `freq` must be a power of
/// two in `(2, RTC_RATE]`.
pub fn rtc_write(terminal_index: usize, freq: u32) -> i32 {
    if freq < 2 || freq > RTC_RATE || !freq.is_power_of_two() {
        return -1;
    }
    terminal::with_rtc_state(terminal_index, |divider, _counter, _received| {
        *divider = RTC_RATE / freq;
    });
    0
}

/// Spin (interrupts enabled) until `terminal_index`'s virtual RTC interrupt
/// fires, then clear the flag and return 0.
#[must_use]
pub fn rtc_read(terminal_index: usize) -> i32 {
    arch::sti();
    loop {
        let fired = terminal::with_rtc_state(terminal_index, |_d, _c, received| *received);
        if fired {
            break;
        }
    }
    terminal::with_rtc_state(terminal_index, |_d, _c, received| *received = false);
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn rtc_write_rejects_non_power_of_two() {
        assert_eq!(rtc_write(0, 3), -1);
    }

    #[test_case]
    fn rtc_write_rejects_above_hardware_rate() {
        assert_eq!(rtc_write(0, RTC_RATE * 2), -1);
    }

    #[test_case]
    fn rtc_open_resets_divider_to_two_hz() {
        rtc_write(0, 512);
        rtc_open(0);
        let divider = terminal::with_rtc_state(0, |d, _c, _r| *d);
        assert_eq!(divider, RTC_RATE / 2);
    }
}
