//! Three virtual terminals, keyboard scan-code decoding, and the
//! line-disciplined input buffer shared between the keyboard ISR and
//! blocking reads.
//!
//! Grounded in `terminal_driver.c`/`terminal_driver.h` for the terminal
//! record and line discipline, and `keyboard.c` for scan-code decoding and
//! the modifier/special-key behavior. Scan-code numbers that `keyboard.h`
//! would have defined (not present in the retrieved source) are the
//! standard PS/2 scan-code-set-1 make/break codes.

use spin::Mutex;

use crate::arch;
use crate::paging;
use crate::pic;
use crate::vga_buffer;

/// Number of virtual terminals.
pub const MAX_TERMINALS: usize = 3;
/// Size of each terminal's line-input buffer.
pub const BUFFER_SIZE: usize = 128;

const KB_DATA_PORT: u16 = 0x60;

const ALT_PRESS: u8 = 0x38;
const ALT_RELEASE: u8 = 0xB8;
const L_SHIFT_PRESS: u8 = 0x2A;
const L_SHIFT_RELEASE: u8 = 0xAA;
const R_SHIFT_PRESS: u8 = 0x36;
const R_SHIFT_RELEASE: u8 = 0xB6;
const CAPS_LOCK: u8 = 0x3A;
const CTRL_PRESS: u8 = 0x1D;
const CTRL_RELEASE: u8 = 0x9D;
const SCANCODE_C: u8 = 0x2E;
const SCANCODE_L: u8 = 0x26;
const ENTER: u8 = 0x1C;
const BACKSPACE: u8 = 0x0E;
const TAB: u8 = 0x0F;
const F1_PRESS: u8 = 0x3B;
const F2_PRESS: u8 = 0x3C;
const F3_PRESS: u8 = 0x3D;

const CAPS_PRESSED: usize = 2;
const KEYS: usize = 0x3B;
const MODS: usize = 4;

#[rustfmt::skip]
static SCAN_CODE_2: [[u8; KEYS]; MODS] = [
    // normal
    [0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0, 0,
     b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', 0, 0, b'a', b's',
     b'd', b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v',
     b'b', b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ', 0],
    // shift
    [0, 0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0, 0,
     b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'{', b'}', 0, 0, b'A', b'S',
     b'D', b'F', b'G', b'H', b'J', b'K', b'L', b':', b'"', b'~', 0, b'|', b'Z', b'X', b'C', b'V',
     b'B', b'N', b'M', b'<', b'>', b'?', 0, b'*', 0, b' ', 0],
    // caps
    [0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 0, 0,
     b'Q', b'W', b'E', b'R', b'T', b'Y', b'U', b'I', b'O', b'P', b'[', b']', 0, 0, b'A', b'S',
     b'D', b'F', b'G', b'H', b'J', b'K', b'L', b';', b'\'', b'`', 0, b'\\', b'Z', b'X', b'C', b'V',
     b'B', b'N', b'M', b',', b'.', b'/', 0, b'*', 0, b' ', 0],
    // shift + caps
    [0, 0, b'!', b'@', b'#', b'$', b'%', b'^', b'&', b'*', b'(', b')', b'_', b'+', 0, 0,
     b'q', b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'{', b'}', 0, 0, b'a', b's',
     b'd', b'f', b'g', b'h', b'j', b'k', b'l', b':', b'"', b'~', 0, b'|', b'z', b'x', b'c', b'v',
     b'b', b'n', b'm', b'<', b'>', b'?', 0, b'*', 0, b' ', 0],
];

struct Modifiers {
    shift: bool,
    control: bool,
    caps: bool,
    alt: bool,
}

static MODIFIERS: Mutex<Modifiers> = Mutex::new(Modifiers { shift: false, control: false, caps: false, alt: false });

/// State owned by one virtual terminal.
pub struct Terminal {
    cursor_x: usize,
    cursor_y: usize,
    /// pid of the foreground process, or -1 if none has ever run here.
    pub curr_pid: i32,
    buffer: [u8; BUFFER_SIZE],
    char_idx: usize,
    enter_flag: bool,
    /// RTC virtual-frequency divider (spec.md §4.H).
    pub rtc_divider: u32,
    rtc_counter: u32,
    rtc_interrupt_received: bool,
    /// Kernel stack pointer saved by the scheduler at the last suspension.
    pub esp_save: u32,
    /// Kernel frame pointer saved by the scheduler at the last suspension.
    pub ebp_save: u32,
    /// `tss.esp0` saved by the scheduler at the last suspension.
    pub tss_esp0_save: u32,
    /// Set by ctrl+C; consumed by the scheduler on this terminal's next
    /// slot.
    pub halt_flag: bool,
    video_backing: [u8; 4096],
}

const RTC_RATE: u32 = 1024;

impl Terminal {
    const fn new() -> Self {
        Self {
            cursor_x: 0,
            cursor_y: 0,
            curr_pid: -1,
            buffer: [b' '; BUFFER_SIZE],
            char_idx: 0,
            enter_flag: false,
            rtc_divider: RTC_RATE / 2,
            rtc_counter: 0,
            rtc_interrupt_received: false,
            esp_save: 0,
            ebp_save: 0,
            tss_esp0_save: 0,
            halt_flag: false,
            video_backing: [0; 4096],
        }
    }
}

struct TerminalState {
    terminals: [Terminal; MAX_TERMINALS],
    visible_terminal: usize,
    target_visible_terminal: usize,
    active_terminal: usize,
}

static STATE: Mutex<TerminalState> = Mutex::new(TerminalState {
    terminals: [Terminal::new(), Terminal::new(), Terminal::new()],
    visible_terminal: 0,
    target_visible_terminal: 0,
    active_terminal: 0,
});

/// Index of the terminal whose backing page is mapped at physical 0xB8000.
#[must_use]
pub fn visible_terminal() -> usize {
    STATE.lock().visible_terminal
}

/// Index of the terminal whose process is currently scheduled.
#[must_use]
pub fn active_terminal() -> usize {
    STATE.lock().active_terminal
}

/// Set which terminal's process is currently scheduled. Only the scheduler
/// calls this.
pub fn set_active_terminal(index: usize) {
    STATE.lock().active_terminal = index;
}

/// Request a visible-terminal swap; the scheduler performs it on that
/// terminal's next slot (spec.md §4.G, §4.K).
pub fn request_visible_terminal(index: usize) {
    STATE.lock().target_visible_terminal = index;
}

/// The physical address this terminal's video memory currently lives at:
/// live 0xB8000 if it is the visible terminal, its own backing page
/// otherwise.
#[must_use]
pub fn active_terminal_video_addr() -> u32 {
    let state = STATE.lock();
    let active = state.active_terminal;
    if active == state.visible_terminal {
        paging::VIDEO_REAL_ADDR
    } else {
        core::ptr::addr_of!(state.terminals[active].video_backing) as u32
    }
}

/// Read the pid recorded for `curr_pid` of terminal `index`.
#[must_use]
pub fn curr_pid_of(index: usize) -> i32 {
    STATE.lock().terminals[index].curr_pid
}

/// Record the pid currently running on terminal `index`.
pub fn set_curr_pid_of(index: usize, pid: i32) {
    STATE.lock().terminals[index].curr_pid = pid;
}

/// Snapshot the saved-register triple for terminal `index` (scheduler use).
pub fn save_context(index: usize, esp: u32, ebp: u32, tss_esp0: u32) {
    let mut state = STATE.lock();
    let term = &mut state.terminals[index];
    term.esp_save = esp;
    term.ebp_save = ebp;
    term.tss_esp0_save = tss_esp0;
}

/// Retrieve the saved-register triple for terminal `index` (scheduler use).
#[must_use]
pub fn saved_context(index: usize) -> (u32, u32, u32) {
    let state = STATE.lock();
    let term = &state.terminals[index];
    (term.esp_save, term.ebp_save, term.tss_esp0_save)
}

/// Take and clear terminal `index`'s halt-request flag.
pub fn take_halt_flag(index: usize) -> bool {
    let mut state = STATE.lock();
    let flag = state.terminals[index].halt_flag;
    state.terminals[index].halt_flag = false;
    flag
}

/// Perform the visible-terminal swap if `target` equals `next` and differs
/// from the current visible terminal, copying video memory both ways.
/// Called from the scheduler before switching `active_terminal`.
pub fn maybe_swap_visible(next: usize) {
    let mut state = STATE.lock();
    if state.target_visible_terminal != state.visible_terminal && state.target_visible_terminal == next {
        let old_visible = state.visible_terminal;
        // SAFETY: both the live VGA buffer and the backing array are valid
        // 4000-byte regions; this only runs with interrupts disabled.
        unsafe {
            let live = paging::VIDEO_REAL_ADDR as *mut u8;
            let backing = state.terminals[old_visible].video_backing.as_mut_ptr();
            core::ptr::copy_nonoverlapping(live, backing, 4096);
            let new_backing = state.terminals[next].video_backing.as_ptr();
            core::ptr::copy_nonoverlapping(new_backing, live, 4096);
        }
        state.visible_terminal = next;
        let (x, y) = (state.terminals[next].cursor_x, state.terminals[next].cursor_y);
        drop(state);
        vga_buffer::set_cursor(x, y);
    }
}

/// Clear the screen and place the cursor at the origin, as ctrl+L and the
/// scheduler's first-time terminal bring-up do.
pub fn clear_and_home() {
    vga_buffer::clear_screen();
    vga_buffer::set_cursor(0, 0);
    let mut state = STATE.lock();
    let active = state.active_terminal;
    state.terminals[active].cursor_x = 0;
    state.terminals[active].cursor_y = 0;
}

fn add_char_to_buffer(kb_char: u8) -> bool {
    let mut state = STATE.lock();
    let visible = state.visible_terminal;
    let term = &mut state.terminals[visible];
    match kb_char {
        b'\n' => {
            term.enter_flag = true;
            let idx = term.char_idx.min(BUFFER_SIZE - 1);
            term.buffer[idx] = b'\n';
            true
        }
        BACKSPACE => {
            if term.char_idx > 0 {
                term.buffer[term.char_idx - 1] = b' ';
                term.char_idx -= 1;
                true
            } else {
                false
            }
        }
        _ if term.char_idx < BUFFER_SIZE - 1 => {
            term.buffer[term.char_idx] = kb_char;
            term.char_idx += 1;
            true
        }
        _ => false,
    }
}

/// Decode one scan code, updating modifier state or the line buffer.
/// Returns `true` if the code was consumed as a modifier/special key (and
/// should not also be looked up in the printable table).
fn special_chars(scan_code: u8) -> bool {
    match scan_code {
        ALT_PRESS => {
            MODIFIERS.lock().alt = true;
            true
        }
        ALT_RELEASE => {
            MODIFIERS.lock().alt = false;
            true
        }
        L_SHIFT_PRESS | R_SHIFT_PRESS => {
            MODIFIERS.lock().shift = true;
            true
        }
        L_SHIFT_RELEASE | R_SHIFT_RELEASE => {
            MODIFIERS.lock().shift = false;
            true
        }
        CAPS_LOCK => {
            let mut mods = MODIFIERS.lock();
            mods.caps = !mods.caps;
            true
        }
        CTRL_PRESS => {
            MODIFIERS.lock().control = true;
            true
        }
        CTRL_RELEASE => {
            MODIFIERS.lock().control = false;
            true
        }
        SCANCODE_C if MODIFIERS.lock().control => {
            let visible = STATE.lock().visible_terminal;
            STATE.lock().terminals[visible].halt_flag = true;
            true
        }
        SCANCODE_L if MODIFIERS.lock().control => {
            clear_and_home();
            true
        }
        ENTER => {
            if add_char_to_buffer(b'\n') {
                vga_buffer::write_byte(b'\n');
            }
            true
        }
        BACKSPACE => {
            if add_char_to_buffer(BACKSPACE) {
                vga_buffer::write_byte(b' ');
            }
            true
        }
        TAB => {
            if add_char_to_buffer(b' ') {
                vga_buffer::write_byte(b' ');
            }
            true
        }
        F1_PRESS if MODIFIERS.lock().alt => {
            request_visible_terminal(0);
            true
        }
        F2_PRESS if MODIFIERS.lock().alt => {
            request_visible_terminal(1);
            true
        }
        F3_PRESS if MODIFIERS.lock().alt => {
            request_visible_terminal(2);
            true
        }
        F1_PRESS | F2_PRESS | F3_PRESS => true,
        _ => false,
    }
}

/// The keyboard interrupt handler. Acquires exclusive state, temporarily
/// retargets `active_terminal` to `visible_terminal` so echoed output lands
/// on screen, decodes one scan code, and returns.
///
/// # Safety
/// Must only be called from the IDT's keyboard vector.
pub unsafe fn keyboard_interrupt() {
    arch::cli();

    let prev_active = STATE.lock().active_terminal;
    let visible = STATE.lock().visible_terminal;
    STATE.lock().active_terminal = visible;

    // SAFETY: reading the keyboard controller's data port is always valid
    // once the keyboard IRQ has fired.
    let scan_code = unsafe { arch::Port::new(KB_DATA_PORT).read() };

    let is_special = special_chars(scan_code);
    let (control, row) = {
        let mods = MODIFIERS.lock();
        (mods.control, usize::from(mods.shift) + usize::from(mods.caps) * CAPS_PRESSED)
    };
    let printable =
        !is_special && (scan_code as usize) < KEYS && !control && SCAN_CODE_2[row][scan_code as usize] != 0;

    if printable {
        let ch = SCAN_CODE_2[row][scan_code as usize];
        if add_char_to_buffer(ch) {
            vga_buffer::write_byte(ch);
        }
    }

    STATE.lock().active_terminal = prev_active;

    arch::sti();
    // SAFETY: this IRQ is the one just serviced.
    unsafe {
        pic::send_eoi(pic::InterruptIndex::Keyboard.as_u8());
    }
}

/// Blocking line read for stdin (fd 0). Spins with interrupts enabled on
/// the active terminal's enter flag (spec.md §9 issue iii: interrupts stay
/// enabled for the whole spin, not just until the flag is observed).
#[must_use]
pub fn read(buf: &mut [u8]) -> i32 {
    loop {
        let active = STATE.lock().active_terminal;
        if STATE.lock().terminals[active].enter_flag {
            break;
        }
    }

    let mut state = STATE.lock();
    let active = state.active_terminal;
    let term = &mut state.terminals[active];

    let mut read_bytes = 0_i32;
    let cap = buf.len().min(BUFFER_SIZE);
    for i in 0..cap {
        let ch = term.buffer[i];
        buf[i] = ch;
        term.buffer[i] = b' ';
        if ch == b'\n' {
            read_bytes = (i + 1) as i32;
            break;
        }
        if i == cap - 1 {
            buf[i] = b'\n';
            read_bytes = (i + 1) as i32;
        }
    }

    term.char_idx = 0;
    term.enter_flag = false;
    read_bytes
}

/// Write `buf` to the screen, skipping NUL bytes, for stdout (fd 1).
pub fn write(buf: &[u8]) -> i32 {
    for &byte in buf {
        if byte != 0 {
            vga_buffer::write_byte(byte);
        }
    }
    buf.len() as i32
}

/// Terminal-owned RTC virtualization state access, used by [`crate::rtc`].
pub fn with_rtc_state<R>(index: usize, f: impl FnOnce(&mut u32, &mut u32, &mut bool) -> R) -> R {
    let mut state = STATE.lock();
    let term = &mut state.terminals[index];
    f(&mut term.rtc_divider, &mut term.rtc_counter, &mut term.rtc_interrupt_received)
}

const MASTER_8259_IMR: u16 = 0x21;

/// Initialize the keyboard IRQ line on the PIC by unmasking IRQ 1, matching
/// `keyboard_init()`'s `enable_irq(KB_IRQ)`.
///
/// # Safety
/// Must run after [`crate::pic::init`].
pub unsafe fn init() {
    let port = arch::Port::new(MASTER_8259_IMR);
    // SAFETY: clears bit 1 (IRQ 1) of the master PIC's mask register; the
    // PIC has already been initialized by pic::init.
    unsafe {
        let mask = port.read() & !(1 << 1);
        port.write(mask);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn add_char_to_buffer_tracks_index() {
        STATE.lock().terminals[0].char_idx = 0;
        STATE.lock().visible_terminal = 0;
        assert!(add_char_to_buffer(b'a'));
        assert_eq!(STATE.lock().terminals[0].char_idx, 1);
    }

    #[test_case]
    fn backspace_on_empty_buffer_fails() {
        STATE.lock().terminals[0].char_idx = 0;
        STATE.lock().visible_terminal = 0;
        assert!(!add_char_to_buffer(BACKSPACE));
    }
}
