//! Test that a double fault is delivered rather than escalating to a triple
//! fault (reboot), reached here via deep recursion exhausting the boot stack.
//!
//! This kernel has no IST (spec.md §9 issue i: double faults intentionally do
//! not terminate a process, and production's handler hangs rather than
//! returning), so this test installs its own double-fault handler rather than
//! production's, and that handler reports success as soon as it is entered.

#![no_std]
#![no_main]

use core::panic::PanicInfo;
use triterm_os::arch::idt::{set_handler_with_code, GateType, InterruptStackFrame};
use triterm_os::{arch, exit_qemu, serial_print, serial_println, QemuExitCode};

#[unsafe(no_mangle)]
pub extern "C" fn _start() -> ! {
    serial_print!("stack_overflow::stack_overflow...\t");

    // SAFETY: first code to run in this test binary, single core.
    unsafe {
        arch::gdt::init();
        set_handler_with_code(8, test_double_fault_handler, GateType::Trap, 0);
        arch::idt::load();
    }

    stack_overflow();

    panic!("Execution should not reach here");
}

#[expect(
    unconditional_recursion,
    reason = "This function is expected to cause a stack overflow."
)]
fn stack_overflow() {
    stack_overflow();
    // Prevent tail-call optimization from turning recursion into a loop.
    core::hint::black_box(0);
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    triterm_os::test_panic_handler(info)
}

extern "x86-interrupt" fn test_double_fault_handler(
    _stack_frame: InterruptStackFrame,
    _error_code: u32,
) -> ! {
    serial_println!("[ok]");
    exit_qemu(QemuExitCode::Success);

    #[expect(
        clippy::empty_loop,
        reason = "Endless loop when test finish. It should not be possible as we exit_qemu before."
    )]
    loop {}
}
