//! 32-bit Interrupt Descriptor Table.
//!
//! Grounded in `init_idt.c`: exception vectors get trap gates at DPL 0,
//! hardware IRQ vectors get interrupt gates at DPL 0, and the syscall vector
//! (0x80) gets an interrupt gate at DPL 3 so user mode may invoke it
//! directly. The teacher's `interrupts.rs` builds an IDT the same shape via
//! the `x86_64` crate's `InterruptDescriptorTable`; that type is 64-bit only,
//! so the entries are hand-rolled here.

use core::arch::asm;
use spin::Mutex;

use super::gdt::KERNEL_CS;

const IDT_ENTRIES: usize = 256;

/// Vector of the syscall software interrupt (`int 0x80`).
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Stack frame the CPU pushes before entering an `"x86-interrupt"` handler.
///
/// `esp`/`ss` are only meaningful when the interrupt crossed a privilege
/// level (the common case here: user-mode code interrupted by PIT, keyboard,
/// RTC, or syscall).
#[repr(C)]
pub struct InterruptStackFrame {
    /// Faulting/return instruction pointer.
    pub eip: u32,
    /// Code segment selector at the time of the interrupt.
    pub cs: u32,
    /// Flags register at the time of the interrupt.
    pub eflags: u32,
    /// User stack pointer, present on a privilege-level change.
    pub esp: u32,
    /// User stack segment, present on a privilege-level change.
    pub ss: u32,
}

/// Handler signature for vectors with no CPU-pushed error code.
pub type HandlerFn = extern "x86-interrupt" fn(InterruptStackFrame);
/// Handler signature for vectors with a CPU-pushed error code (several CPU
/// exceptions).
pub type HandlerFnWithCode = extern "x86-interrupt" fn(InterruptStackFrame, u32);

/// Gate type, selecting whether entry leaves interrupts as the IF flag
/// already has them (trap gate) or forces them off (interrupt gate).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    /// Used for CPU exceptions (DPL 0 in this kernel).
    Trap,
    /// Used for hardware IRQs and the syscall gate.
    Interrupt,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn new(handler: u32, gate: GateType, dpl: u8) -> Self {
        let gate_bits: u8 = match gate {
            GateType::Interrupt => 0x0E,
            GateType::Trap => 0x0F,
        };
        let type_attr = 0x80 | ((dpl & 0x3) << 5) | gate_bits;
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CS,
            zero: 0,
            type_attr,
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static IDT: Mutex<[IdtEntry; IDT_ENTRIES]> = Mutex::new([IdtEntry::missing(); IDT_ENTRIES]);

/// Install a handler with no CPU error code at `vector`.
pub fn set_handler(vector: u8, handler: HandlerFn, gate: GateType, dpl: u8) {
    let mut idt = IDT.lock();
    idt[vector as usize] = IdtEntry::new(handler as usize as u32, gate, dpl);
}

/// Install a handler that receives the CPU's pushed error code at `vector`.
pub fn set_handler_with_code(vector: u8, handler: HandlerFnWithCode, gate: GateType, dpl: u8) {
    let mut idt = IDT.lock();
    idt[vector as usize] = IdtEntry::new(handler as usize as u32, gate, dpl);
}

/// Load the IDT register (`lidt`). Call once, after every vector of
/// interest has been installed.
///
/// # Safety
/// Must run after [`set_handler`]/[`set_handler_with_code`] calls for every
/// vector the kernel expects to receive, and after [`super::gdt::init`] so
/// `KERNEL_CS` is a valid selector.
pub unsafe fn load() {
    // SAFETY: holds IDT's lock only long enough to take the address of its
    // inner data; no other code ever re-enters this far during boot.
    let table_addr = core::ptr::addr_of!(*IDT.lock()) as u32;
    let idt_ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[IdtEntry; IDT_ENTRIES]>() - 1) as u16,
        base: table_addr,
    };
    // SAFETY: idt_ptr references the static IDT's inner array, which
    // outlives this call.
    unsafe {
        asm!("lidt [{0}]", in(reg) &idt_ptr, options(readonly, nostack, preserves_flags));
    }
}
