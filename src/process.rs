//! Process control blocks, pid allocation, and the `execute`/`halt` pair.
//!
//! Grounded in `syscalls.c`'s `pcb_t` layout and `execute`/`halt` logic. The
//! ring-3 transition and the "execute returns when its child halts" idiom
//! are adapted from the teacher's `userspace::process::switch_to_user_mode`
//! / `userspace::syscall::syscall_entry` pair (naked-asm register surgery
//! around `iretd`), generalized from the teacher's single `KERNEL_RSP`
//! static to one saved-register slot per PCB, since this kernel supports
//! more than one suspended `execute` call at a time. Per spec.md §9's design
//! note, this is the permitted "explicit context-switch primitive"
//! substitute for the source's raw `leave; ret` stack-frame surgery.

use spin::Mutex;

use crate::arch::gdt::{KERNEL_DS, TSS, USER_CS, USER_DS};
use crate::fd::FdTable;
use crate::fs;
use crate::paging;
use crate::terminal;

/// Maximum number of simultaneously live processes (spec.md §3).
pub const MAX_PROCESSES: usize = 6;
const EIGHT_KB: u32 = 0x0000_2000;
/// Top of the region PCBs and per-process kernel stacks are carved from.
const KERNEL_PAGE: u32 = 0x0080_0000;
/// Offset of a loaded executable's entry point within the user page.
const USER_ENTRY_OFFSET: u32 = 0x0004_8000;
const ELF_HEADER_BYTES: usize = 40;
const NAME_MAX: usize = 32;
const ARGS_MAX: usize = 128;

/// Process control block. Lives at a fixed address derived from its pid, not
/// in any heap or static array (spec.md §3: "no PCB relocates").
struct Pcb {
    pid: u8,
    parent_pid: Option<u8>,
    fd_table: FdTable,
    name: [u8; NAME_MAX],
    name_len: usize,
    args: [u8; ARGS_MAX],
    args_len: usize,
    vidmap_active: bool,
    /// `tss.esp0` the parent had before this process was scheduled in.
    parent_tss_esp0: u32,
    /// The parent's kernel esp/ebp at the moment it called `execute`, so
    /// `halt` can resume exactly there.
    parent_esp: u32,
    parent_ebp: u32,
    /// Which terminal this process belongs to, for RTC/terminal dispatch.
    terminal_index: usize,
}

fn pcb_ptr(pid: u8) -> *mut Pcb {
    (KERNEL_PAGE - (u32::from(pid) + 1) * EIGHT_KB) as *mut Pcb
}

fn kernel_stack_top(pid: u8) -> u32 {
    KERNEL_PAGE - u32::from(pid) * EIGHT_KB - 4
}

static PID_USED: Mutex<[bool; MAX_PROCESSES]> = Mutex::new([false; MAX_PROCESSES]);
static CURRENT_PID: Mutex<i32> = Mutex::new(-1);

/// The pid of the process currently bound to the CPU, or -1 if none.
#[must_use]
pub fn current_pid() -> i32 {
    *CURRENT_PID.lock()
}

/// Used by the scheduler when switching terminals, since `CURRENT_PID` is a
/// process-wide singleton saved/restored per terminal (spec.md §3, "Global
/// indices").
pub fn set_current_pid(pid: i32) {
    *CURRENT_PID.lock() = pid;
}

/// Whether `pid`'s PCB has called `vidmap`, used by the scheduler to reapply
/// the correct mapping for whichever process a timer tick resumes (spec.md
/// §3/§4.C: `VIDMAP_PAGE` is present iff the current process called vidmap).
///
/// # Safety
/// `pid` must be a currently-allocated pid (its PCB is initialized).
#[must_use]
pub unsafe fn vidmap_of(pid: u8) -> bool {
    // SAFETY: forwarded from the caller's precondition.
    unsafe { (*pcb_ptr(pid)).vidmap_active }
}

fn allocate_pid() -> Option<u8> {
    let mut used = PID_USED.lock();
    let slot = used.iter().position(|&u| !u)?;
    used[slot] = true;
    Some(slot as u8)
}

fn free_pid(pid: u8) {
    PID_USED.lock()[pid as usize] = false;
}

/// Split `cmd` into a trimmed command name and its argument string, per
/// `execute`'s step 1.
fn split_command(cmd: &[u8]) -> (&[u8], &[u8]) {
    let mut start = 0;
    while start < cmd.len() && cmd[start] == b' ' {
        start += 1;
    }
    let rest = &cmd[start..];
    match rest.iter().position(|&b| b == b' ') {
        Some(split) => (&rest[..split], &rest[split + 1..]),
        None => (rest, &[]),
    }
}

/// Launch `cmd` as a new process, returning only once that process (and
/// every process it transitively launches) has exited. Returns -1 if no
/// process could be started at all.
#[must_use]
pub fn execute(cmd: &[u8]) -> i32 {
    let (name, args) = split_command(cmd);
    if name.len() > NAME_MAX || args.len() > ARGS_MAX {
        return -1;
    }

    let Some(dentry) = fs::with_fs(|f| f.read_dentry_by_name(name)).and_then(Result::ok) else {
        return -1;
    };

    let mut header = [0_u8; ELF_HEADER_BYTES];
    let Some(Ok(read)) = fs::with_fs(|f| f.read_data(dentry.inode as u32, 0, &mut header)) else {
        return -1;
    };
    if (read as usize) < ELF_HEADER_BYTES || header[0..4] != [0x7F, b'E', b'L', b'F'] {
        return -1;
    }
    let entry = u32::from_le_bytes([header[24], header[25], header[26], header[27]]);

    let Some(new_pid) = allocate_pid() else {
        return -1;
    };

    let parent_pid_i32 = current_pid();
    let terminal_index = terminal::active_terminal();

    let mut pcb = Pcb {
        pid: new_pid,
        parent_pid: if parent_pid_i32 < 0 { None } else { Some(parent_pid_i32 as u8) },
        fd_table: FdTable::new(),
        name: [0; NAME_MAX],
        name_len: name.len(),
        args: [0; ARGS_MAX],
        args_len: args.len(),
        vidmap_active: false,
        parent_tss_esp0: 0,
        parent_esp: 0,
        parent_ebp: 0,
        terminal_index,
    };
    pcb.name[..name.len()].copy_from_slice(name);
    pcb.args[..args.len()].copy_from_slice(args);

    // SAFETY: set_process_paging installs the new process's 4 MB user page
    // before any user memory is touched below.
    unsafe {
        paging::set_process_paging(u32::from(new_pid), false);
    }

    let user_image = (paging::USER_VIRT_BASE + USER_ENTRY_OFFSET) as *mut u8;
    let mut offset = 0_u32;
    loop {
        let mut chunk = [0_u8; 512];
        let Some(Ok(read)) = fs::with_fs(|f| f.read_data(dentry.inode as u32, offset, &mut chunk)) else {
            free_pid(new_pid);
            return -1;
        };
        if read == 0 {
            break;
        }
        // SAFETY: user_image points into the page just installed above, at
        // most 4 MB from its base; load images in this kernel are always
        // far smaller.
        unsafe {
            core::ptr::copy_nonoverlapping(chunk.as_ptr(), user_image.add(offset as usize), read as usize);
        }
        offset += read;
    }

    let new_kernel_esp = kernel_stack_top(new_pid);
    let parent_tss_esp0 = {
        let mut tss = TSS.lock();
        let prev = tss.esp0;
        tss.esp0 = new_kernel_esp;
        tss.ss0 = KERNEL_DS;
        prev
    };
    pcb.parent_tss_esp0 = parent_tss_esp0;

    // SAFETY: pcb_ptr(new_pid) names a fixed, unused 8 KB kernel region
    // reserved for this pid; nothing else writes there while the pid is
    // marked used.
    unsafe {
        pcb_ptr(new_pid).write(pcb);
    }

    set_current_pid(i32::from(new_pid));
    terminal::set_curr_pid_of(terminal_index, i32::from(new_pid));

    let user_esp = paging::USER_VIRT_BASE + 0x0040_0000 - 4;
    let save_slot = unsafe { core::ptr::addr_of_mut!((*pcb_ptr(new_pid)).parent_esp) };

    // SAFETY: new_kernel_esp is the top of the freshly reserved kernel
    // stack for new_pid; entry/user_esp were validated/computed above.
    unsafe { transfer_to_user(entry, user_esp, save_slot, new_kernel_esp) }
}

/// Naked trampoline: records the caller's (parent's) esp/ebp into the new
/// PCB, switches onto the new process's kernel stack, builds a ring-3
/// `iret` frame, and enters user mode. Never returns in the usual sense —
/// execution resumes here only indirectly, via [`resume_parent`] restoring
/// the saved esp/ebp and `ret`-ing out of the `call` that invoked this
/// function, which is how `execute` "returns" when its child halts.
///
/// # Safety
/// `new_kernel_esp` must be the unused top of a valid per-pid kernel stack;
/// `entry`/`user_stack` must be valid pointers into the process just mapped
/// by `set_process_paging`.
#[naked]
unsafe extern "C" fn transfer_to_user(
    _entry: u32,
    _user_stack: u32,
    _save_slot: *mut u32,
    _new_kernel_esp: u32,
) -> ! {
    // SAFETY: manually manages the stack layout; see function doc.
    unsafe {
        core::arch::naked_asm!(
            "mov eax, [esp+4]",   // entry
            "mov ecx, [esp+8]",   // user_stack
            "mov edx, [esp+12]",  // save_slot -> &mut parent_esp (parent_ebp follows it)
            "mov [edx], esp",
            "mov [edx+4], ebp",
            "mov ebx, [esp+16]",  // new_kernel_esp
            "mov esp, ebx",
            "push {user_ds}",
            "push ecx",
            "pushfd",
            "pop ecx",
            "or ecx, 0x200",
            "push ecx",
            "push {user_cs}",
            "push eax",
            "iretd",
            user_ds = const USER_DS,
            user_cs = const USER_CS,
        );
    }
}

/// Naked trampoline: restores a parent's saved esp/ebp and returns `status`
/// from its earlier, still-on-the-stack `call transfer_to_user`, completing
/// the "execute returns when the child halts" contract.
///
/// # Safety
/// `saved_esp`/`saved_ebp` must be a pair previously captured by
/// [`transfer_to_user`] for a process that has not already been resumed.
#[naked]
unsafe extern "C" fn resume_parent(_saved_esp: u32, _saved_ebp: u32, _status: i32) -> ! {
    // SAFETY: restores a stack this kernel itself suspended in execute();
    // the ret that follows pops the original `call transfer_to_user`
    // return address still sitting at [saved_esp].
    unsafe {
        core::arch::naked_asm!(
            "mov eax, [esp+12]", // status
            "mov ecx, [esp+4]",  // saved_esp
            "mov edx, [esp+8]",  // saved_ebp
            "mov esp, ecx",
            "mov ebp, edx",
            "ret",
        );
    }
}

/// `halt(status)`: truncates to 8 bits, per spec.md §4.J step 1.
pub fn halt(status: i32) -> ! {
    terminate(status & 0xFF)
}

/// `kill_current_proc(status)`: used by exception handlers and ctrl+C, which
/// pass the distinguished out-of-range status 256 through untouched.
pub fn kill_current_proc(status: i32) -> ! {
    terminate(status)
}

fn terminate(status: i32) -> ! {
    let pid = current_pid();
    assert!(pid >= 0, "halt with no running process");
    let pid = pid as u8;

    // SAFETY: pid is the currently running process, so its PCB was
    // initialized by execute and is exclusively owned by this thread of
    // control.
    let pcb = unsafe { &mut *pcb_ptr(pid) };
    pcb.fd_table.close_all();
    free_pid(pid);

    match pcb.parent_pid {
        None => loop {
            execute(b"shell");
        },
        Some(parent_pid) => {
            set_current_pid(i32::from(parent_pid));
            terminal::set_curr_pid_of(pcb.terminal_index, i32::from(parent_pid));

            // SAFETY: parent_pid was marked used until the child that is
            // exiting took its place; reading its PCB here is safe because
            // the parent is suspended, not concurrently executing.
            let parent_vidmap = unsafe { (*pcb_ptr(parent_pid)).vidmap_active };
            // SAFETY: parent_pid is a live pid with an installed user page.
            unsafe {
                paging::set_process_paging(u32::from(parent_pid), parent_vidmap);
            }

            {
                let mut tss = TSS.lock();
                tss.esp0 = pcb.parent_tss_esp0;
                tss.ss0 = KERNEL_DS;
            }

            let (esp, ebp) = (pcb.parent_esp, pcb.parent_ebp);
            // SAFETY: esp/ebp were captured by this same pid's
            // transfer_to_user call and have not been resumed since.
            unsafe { resume_parent(esp, ebp, status) }
        }
    }
}

fn current_pcb() -> Option<&'static mut Pcb> {
    let pid = current_pid();
    if pid < 0 {
        return None;
    }
    // SAFETY: pid names the process currently bound to the CPU.
    Some(unsafe { &mut *pcb_ptr(pid as u8) })
}

/// `open(name)` (spec.md §4.I).
pub fn sys_open(name: &[u8]) -> i32 {
    let Some(pcb) = current_pcb() else { return -1 };
    pcb.fd_table.open(name, pcb.terminal_index)
}

/// `read(fd, buf, n)`.
pub fn sys_read(fd: i32, buf: &mut [u8]) -> i32 {
    let Some(pcb) = current_pcb() else { return -1 };
    if fd < 0 || fd as usize >= crate::fd::MAX_FILE_DESCRIPTORS {
        return -1;
    }
    pcb.fd_table.read(fd as usize, buf, pcb.terminal_index)
}

/// `write(fd, buf, n)`.
pub fn sys_write(fd: i32, buf: &[u8]) -> i32 {
    let Some(pcb) = current_pcb() else { return -1 };
    if fd < 0 || fd as usize >= crate::fd::MAX_FILE_DESCRIPTORS {
        return -1;
    }
    pcb.fd_table.write(fd as usize, buf, pcb.terminal_index)
}

/// `close(fd)`.
pub fn sys_close(fd: i32) -> i32 {
    let Some(pcb) = current_pcb() else { return -1 };
    if fd < 0 || fd as usize >= crate::fd::MAX_FILE_DESCRIPTORS {
        return -1;
    }
    pcb.fd_table.close(fd as usize)
}

/// `getargs(buf, n)`.
pub fn sys_getargs(buf: &mut [u8]) -> i32 {
    let Some(pcb) = current_pcb() else { return -1 };
    if pcb.args_len >= buf.len() {
        return -1;
    }
    buf[..pcb.args_len].copy_from_slice(&pcb.args[..pcb.args_len]);
    buf[pcb.args_len] = 0;
    0
}

/// `vidmap(outptr)`: `outptr` must point inside the 128 MB-132 MB user
/// region.
pub fn sys_vidmap(out_ptr: *mut u32) -> i32 {
    let addr = out_ptr as u32;
    if addr < paging::USER_VIRT_BASE || addr >= paging::USER_VIRT_BASE + 0x0040_0000 {
        return -1;
    }
    let Some(pcb) = current_pcb() else { return -1 };
    pcb.vidmap_active = true;
    // SAFETY: paging is installed; vidmap_paging only ever aliases the
    // calling process's own terminal's backing page.
    unsafe {
        paging::vidmap_paging(true);
    }
    // SAFETY: out_ptr was just bounds-checked against the user region.
    unsafe {
        out_ptr.write(paging::VIDMAP_VIRT_ADDR);
    }
    0
}

/// Install the `int 0x80` syscall gate as an interrupt gate at DPL 3, so user
/// mode may invoke it directly (spec.md §5/§6). Must run before
/// [`crate::arch::idt::load`].
pub fn install_handler() {
    crate::arch::idt::set_handler(
        crate::arch::idt::SYSCALL_VECTOR,
        syscall_entry,
        crate::arch::idt::GateType::Interrupt,
        3,
    );
}

/// Naked entry for `int 0x80`. User mode passes the syscall number in `eax`
/// and up to three arguments in `ebx`/`ecx`/`edx`, mirroring the register
/// convention `syscalls.c`'s callers use. Adapted from the teacher's
/// `userspace::syscall::syscall_entry`: since `halt`/`kill_current_proc`
/// leave this kernel's call stack entirely via [`resume_parent`] instead of
/// returning a sentinel here, no exit-path branch is needed — every syscall
/// that returns at all returns normally into the `iretd` below.
#[naked]
pub(crate) extern "x86-interrupt" fn syscall_entry(_frame: crate::arch::idt::InterruptStackFrame) {
    // SAFETY: manually manages the entire register save/restore and stack
    // layout; see function doc.
    unsafe {
        core::arch::naked_asm!(
            "pusha",
            "push edx", // arg3
            "push ecx", // arg2
            "push ebx", // arg1
            "push eax", // syscall number
            "call {dispatch}",
            "add esp, 16",
            "mov [esp+28], eax", // overwrite saved eax with the return value
            "popa",
            "iretd",
            dispatch = sym syscall_dispatch,
        );
    }
}

/// Bounds-check a user-supplied `(ptr, len)` pair against the calling
/// process's 4 MB user region and hand back a slice into it.
fn validate_user_buf(ptr: u32, len: u32) -> Option<&'static mut [u8]> {
    let end = ptr.checked_add(len)?;
    if ptr < paging::USER_VIRT_BASE || end > paging::USER_VIRT_BASE + 0x0040_0000 {
        return None;
    }
    // SAFETY: ptr..end was just bounds-checked against the active user page.
    Some(unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, len as usize) })
}

/// Read a NUL-terminated string out of user memory (`execute`'s command
/// line, `open`'s filename), capped at `max_len`.
fn validate_user_cstr(ptr: u32, max_len: u32) -> Option<&'static [u8]> {
    let buf = validate_user_buf(ptr, max_len)?;
    let len = buf.iter().position(|&b| b == 0)?;
    Some(&buf[..len])
}

/// Dispatches one syscall, called from the naked [`syscall_entry`] with the
/// cdecl calling convention. Numbers 1-10 per spec.md §6; anything else (and
/// the always-unimplemented 9/10) returns -1.
extern "C" fn syscall_dispatch(num: u32, arg1: u32, arg2: u32, arg3: u32) -> i32 {
    match num {
        1 => halt(arg1 as i32),
        2 => match validate_user_cstr(arg1, (NAME_MAX + ARGS_MAX + 1) as u32) {
            Some(cmd) => execute(cmd),
            None => -1,
        },
        3 => match validate_user_buf(arg2, arg3) {
            Some(buf) => sys_read(arg1 as i32, buf),
            None => -1,
        },
        4 => match validate_user_buf(arg2, arg3) {
            Some(buf) => sys_write(arg1 as i32, buf),
            None => -1,
        },
        5 => match validate_user_cstr(arg1, NAME_MAX as u32) {
            Some(name) => sys_open(name),
            None => -1,
        },
        6 => sys_close(arg1 as i32),
        7 => match validate_user_buf(arg1, arg2) {
            Some(buf) => sys_getargs(buf),
            None => -1,
        },
        8 => {
            if arg1 < paging::USER_VIRT_BASE || arg1 >= paging::USER_VIRT_BASE + 0x0040_0000 {
                -1
            } else {
                sys_vidmap(arg1 as *mut u32)
            }
        }
        // set_handler (9) and sigreturn (10) are not implemented by this
        // kernel; both always fail (spec.md §2).
        9 | 10 => -1,
        _ => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn split_command_trims_leading_spaces_and_splits_on_first_space() {
        let (name, args) = split_command(b"  ls -l");
        assert_eq!(name, b"ls");
        assert_eq!(args, b"-l");
    }

    #[test_case]
    fn split_command_with_no_args_returns_empty_args() {
        let (name, args) = split_command(b"shell");
        assert_eq!(name, b"shell");
        assert_eq!(args, b"");
    }

    #[test_case]
    fn kernel_stack_top_is_linear_in_pid() {
        assert_eq!(kernel_stack_top(0), KERNEL_PAGE - 4);
        assert_eq!(kernel_stack_top(1), KERNEL_PAGE - EIGHT_KB - 4);
    }
}
