//! Programmable interval timer and the cooperative round-robin scheduler.
//!
//! Grounded in the teacher's `timer_interrupt_handler` for the
//! EOI-then-return shape, generalized into the full per-tick terminal
//! handoff spec.md §4.K describes: three terminals take turns, each
//! terminal's process tree runs to its next suspension point (currently a
//! spin inside `terminal_read`/`rtc_read`) before the timer hands the CPU to
//! the next terminal. No PIT programming sequence exists in the retrieved
//! reference material; the command-word/divisor write below follows
//! spec.md §6's literal byte values (0x36 to port 0x43, divisor 11932 to
//! port 0x40).
//!
//! The suspend/resume trampoline below generalizes `process`'s
//! `transfer_to_user`/`resume_parent` pair: capturing a return address by
//! reading `esp`/`ebp` is only valid done at a naked function's own entry,
//! so the handler below calls straight into a naked "capture point" instead
//! of reading the registers from ordinary Rust code partway through a
//! function body.

use crate::arch::{self, gdt, Port};
use crate::paging;
use crate::pic::{self, InterruptIndex};
use crate::process;
use crate::terminal;

const PIT_COMMAND_PORT: u16 = 0x43;
const PIT_CHANNEL_0_PORT: u16 = 0x40;
const PIT_COMMAND: u8 = 0x36;
/// `1_193_182 / 100` rounded: 100 Hz tick rate (spec.md §6).
const PIT_DIVISOR: u16 = 11_932;

/// Register the PIT interrupt handler. Must run before
/// [`crate::arch::idt::load`].
pub fn install_handler() {
    crate::arch::idt::set_handler(
        InterruptIndex::Pit.as_u8(),
        timer_interrupt_handler,
        crate::arch::idt::GateType::Interrupt,
        0,
    );
}

/// Program the PIT for a 100 Hz tick.
///
/// # Safety
/// Must run after [`crate::pic::init`] and before interrupts are enabled.
pub unsafe fn init() {
    let command = Port::new(PIT_COMMAND_PORT);
    let channel0 = Port::new(PIT_CHANNEL_0_PORT);
    // SAFETY: 0x43/0x40 are the standard PIT command/channel-0 ports.
    unsafe {
        command.write(PIT_COMMAND);
        channel0.write((PIT_DIVISOR & 0xFF) as u8);
        channel0.write((PIT_DIVISOR >> 8) as u8);
    }
}

/// Scratch slots `schedule_next` hands a suspend point's esp/ebp through on
/// its way back into the naked resume sequence. Safe because the scheduler
/// never runs reentrantly: interrupts stay off for the whole tick.
static mut RESUME_ESP: u32 = 0;
static mut RESUME_EBP: u32 = 0;

extern "x86-interrupt" fn timer_interrupt_handler(_frame: crate::arch::idt::InterruptStackFrame) {
    arch::cli();
    // SAFETY: this IRQ is the one just serviced.
    unsafe {
        pic::send_eoi(InterruptIndex::Pit.as_u8());
    }
    // SAFETY: called only from this handler, which never returns past this
    // point (schedule_next always diverges into some other context).
    unsafe {
        schedule_next();
    }
}

/// Naked suspend point: captures the exact esp/ebp a bare `ret` would need
/// to resume right here (i.e. right after this `call`, which is all that
/// remains of `timer_interrupt_handler` before its compiler-generated
/// `"x86-interrupt"` epilogue runs), hands them to [`do_schedule`], then
/// either resumes a previously-suspended terminal or diverges into process
/// teardown/launch.
///
/// # Safety
/// Must be reached only via a direct `call` from the PIT handler.
#[naked]
unsafe extern "C" fn schedule_next() -> ! {
    // SAFETY: manually manages the stack; see function doc.
    unsafe {
        core::arch::naked_asm!(
            "mov eax, esp",
            "mov ecx, ebp",
            "push ecx",
            "push eax",
            "call {do_schedule}",
            "mov ecx, [{resume_esp}]",
            "mov edx, [{resume_ebp}]",
            "mov esp, ecx",
            "mov ebp, edx",
            "ret",
            do_schedule = sym do_schedule,
            resume_esp = sym RESUME_ESP,
            resume_ebp = sym RESUME_EBP,
        );
    }
}

/// The seven-step tick body (spec.md §4.K), run with interrupts disabled.
/// Saves `esp`/`ebp` for the currently active terminal, picks the next one
/// round-robin, and either writes its saved esp/ebp into [`RESUME_ESP`] /
/// [`RESUME_EBP`] for `schedule_next` to resume, or diverges directly
/// (first visit to a terminal, or a ctrl+C kill request).
extern "C" fn do_schedule(esp: u32, ebp: u32) {
    let active = terminal::active_terminal();
    let next = (active + 1) % terminal::MAX_TERMINALS;

    terminal::maybe_swap_visible(next);

    let tss_esp0 = gdt::TSS.lock().esp0;
    terminal::save_context(active, esp, ebp, tss_esp0);
    terminal::set_curr_pid_of(active, process::current_pid());

    terminal::set_active_terminal(next);
    process::set_current_pid(terminal::curr_pid_of(next));

    if terminal::curr_pid_of(next) == -1 {
        terminal::clear_and_home();
        // Re-enabling interrupts here (rather than keeping them off across
        // the whole handoff) is safe: the new shell runs in ring 3 with IF
        // set regardless, but it does mean this one branch admits nested
        // timer ticks before execute's ring-3 transfer completes.
        arch::sti();
        process::execute(b"shell");
        unreachable!("a terminal's top-level shell never hands control back here");
    }

    if terminal::take_halt_flag(next) {
        // SAFETY: next's foreground process is the one ctrl+C targeted;
        // current_pid was already pointed at it above.
        unsafe {
            process::kill_current_proc(256);
        }
    }

    let (next_esp, next_ebp, next_tss_esp0) = terminal::saved_context(next);
    {
        let mut tss = gdt::TSS.lock();
        tss.esp0 = next_tss_esp0;
        tss.ss0 = gdt::KERNEL_DS;
    }
    let pid = terminal::curr_pid_of(next);
    if pid >= 0 {
        // SAFETY: pid is the live foreground process of terminal `next`.
        let vidmap_active = unsafe { process::vidmap_of(pid as u8) };
        // SAFETY: pid is the live foreground process of terminal `next`.
        unsafe {
            paging::set_process_paging(pid as u32, vidmap_active);
        }
    }

    // SAFETY: single-threaded handoff to the naked caller, which reads these
    // back immediately with interrupts still disabled.
    unsafe {
        RESUME_ESP = next_esp;
        RESUME_EBP = next_ebp;
    }
}

/// Launch terminal 0's shell. Never returns: `execute` loops forever
/// relaunching the shell once its current occupant has no parent to resume,
/// and from then on every further handoff between terminals happens inside
/// PIT interrupts via [`schedule_next`].
pub fn run() -> ! {
    terminal::set_active_terminal(0);
    process::execute(b"shell");
    unreachable!("terminal 0's shell never hands control back to run()");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn pit_divisor_yields_hundred_hertz() {
        assert_eq!(1_193_182 / u32::from(PIT_DIVISOR), 99);
    }
}
