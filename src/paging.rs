//! Two-level x86 paging: one identity-mapped low region, one 4 MB kernel
//! page, a per-process 4 MB user page, and an on-demand vidmap page.
//!
//! Grounded in `paging.c`/`paging.h`; the raw `u32` entry representation
//! (flags as bit constants rather than C-style bitfields) follows
//! `other_examples`' hand-rolled x86 vmem module, which is the pack's other
//! from-scratch 32-bit paging implementation.

use crate::arch;
use crate::terminal;

/// Page-directory/page-table entries and rows are 4 KB-aligned, 4-byte each.
const ENTRIES_PER_TABLE: usize = 1024;

const FLAG_PRESENT: u32 = 1 << 0;
const FLAG_WRITE: u32 = 1 << 1;
const FLAG_USER: u32 = 1 << 2;
const FLAG_ACCESSED: u32 = 1 << 5;
const FLAG_PAGE_SIZE: u32 = 1 << 7;
const ADDR_MASK: u32 = 0xFFFF_F000;
const PAGE_SHIFT: u32 = 12;

/// Physical address of VGA text-mode memory.
pub const VIDEO_REAL_ADDR: u32 = 0x000B_8000;
const EIGHT_MB: u32 = 0x0080_0000;
const FOUR_MB: u32 = 0x0040_0000;

/// Directory index of the per-process 4 MB user page (virtual 128 MB).
pub const USER_PAGING: usize = 32;
/// Directory index of the vidmap page (virtual 136 MB, `FOUR_MB *
/// VIDMAP_PAGE`).
pub const VIDMAP_PAGE: usize = 34;

/// Virtual base address of the per-process user image, 128 MB.
pub const USER_VIRT_BASE: u32 = FOUR_MB * USER_PAGING as u32;
/// Virtual address the vidmap page is installed at, 136 MB.
pub const VIDMAP_VIRT_ADDR: u32 = FOUR_MB * VIDMAP_PAGE as u32;

type Table = [u32; ENTRIES_PER_TABLE];

#[repr(align(4096))]
struct AlignedTable(Table);

static mut PAGE_DIRECTORY: AlignedTable = AlignedTable([0; ENTRIES_PER_TABLE]);
static mut PAGE_0_TABLE: AlignedTable = AlignedTable([0; ENTRIES_PER_TABLE]);
static mut VIDMAP_TABLE: AlignedTable = AlignedTable([0; ENTRIES_PER_TABLE]);

fn page_table_entry(addr: u32, flags: u32) -> u32 {
    (addr & ADDR_MASK) | flags
}

/// Compute the physical frame backing process `pid`'s user page.
#[must_use]
pub fn physical_addr_for_pid(pid: u32) -> u32 {
    EIGHT_MB + FOUR_MB * pid
}

/// Build the initial identity map and enable paging.
///
/// Mapping established: virtual == physical for `0x00000000..0x00400000`
/// except that only the video-memory page within it is actually present;
/// `0x00400000..0x00800000` is one present 4 MB supervisor page (the
/// kernel's own code/data/stack region).
///
/// # Safety
/// Must run exactly once, very early in boot, before any code relies on a
/// page directory being installed.
pub unsafe fn init() {
    // SAFETY: single-threaded boot-time initialization of the static tables.
    unsafe {
        for i in 0..ENTRIES_PER_TABLE {
            let addr = (i as u32) << PAGE_SHIFT;
            PAGE_0_TABLE.0[i] = if addr == VIDEO_REAL_ADDR {
                page_table_entry(addr, FLAG_PRESENT | FLAG_WRITE | FLAG_ACCESSED)
            } else {
                0
            };
        }

        PAGE_DIRECTORY.0[0] = page_table_entry(
            core::ptr::addr_of!(PAGE_0_TABLE.0) as u32,
            FLAG_PRESENT | FLAG_WRITE | FLAG_ACCESSED,
        );
        PAGE_DIRECTORY.0[1] = page_table_entry(
            FOUR_MB,
            FLAG_PRESENT | FLAG_WRITE | FLAG_ACCESSED | FLAG_PAGE_SIZE,
        );
        for entry in PAGE_DIRECTORY.0.iter_mut().skip(2) {
            *entry = 0;
        }

        arch::enable_pse();
        arch::write_cr3(core::ptr::addr_of!(PAGE_DIRECTORY.0) as u32);
        arch::enable_paging_bit();
    }
}

/// Remap the user-page directory entry to process `pid`'s frame, then
/// reapply the calling process's vidmap setting.
///
/// # Safety
/// `pid` must be a pid whose PCB has already been located; paging must
/// already be enabled via [`init`].
pub unsafe fn set_process_paging(pid: u32, vidmap_active: bool) {
    let physical_address = physical_addr_for_pid(pid);
    // SAFETY: single flat write to the static directory; TLB is flushed by
    // vidmap_paging below regardless of branch taken.
    unsafe {
        PAGE_DIRECTORY.0[USER_PAGING] = page_table_entry(
            physical_address,
            FLAG_PRESENT | FLAG_WRITE | FLAG_USER | FLAG_ACCESSED | FLAG_PAGE_SIZE,
        );
    }

    // SAFETY: flushes and reinstalls VIDMAP_PAGE per vidmap_active.
    unsafe {
        vidmap_paging(vidmap_active);
    }
}

/// Install or remove the vidmap page, aliasing the active terminal's video
/// backing into virtual [`VIDMAP_VIRT_ADDR`].
///
/// # Safety
/// Must only be called once paging is enabled; always flushes the TLB.
pub unsafe fn vidmap_paging(on: bool) {
    if !on {
        // SAFETY: clears a single directory entry, then flushes.
        unsafe {
            PAGE_DIRECTORY.0[VIDMAP_PAGE] = 0;
            arch::flush_tlb();
        }
        return;
    }

    let buffer_mem = terminal::active_terminal_video_addr();

    // SAFETY: VIDMAP_TABLE has only its first entry used; writes are to
    // static mutable tables owned entirely by this module.
    unsafe {
        VIDMAP_TABLE.0[0] =
            page_table_entry(buffer_mem, FLAG_PRESENT | FLAG_WRITE | FLAG_USER | FLAG_ACCESSED);
        PAGE_DIRECTORY.0[VIDMAP_PAGE] = page_table_entry(
            core::ptr::addr_of!(VIDMAP_TABLE.0) as u32,
            FLAG_PRESENT | FLAG_WRITE | FLAG_USER | FLAG_ACCESSED,
        );
        arch::flush_tlb();
    }
}

/// Flush the TLB. Thin re-export so callers outside `arch` don't need to
/// know paging is built on top of it.
///
/// # Safety
/// Must only be called once paging is enabled.
pub unsafe fn flush_tlb() {
    // SAFETY: delegates to arch::flush_tlb under the same contract.
    unsafe {
        arch::flush_tlb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn physical_addr_is_linear_in_pid() {
        assert_eq!(physical_addr_for_pid(0), EIGHT_MB);
        assert_eq!(physical_addr_for_pid(1), EIGHT_MB + FOUR_MB);
        assert_eq!(physical_addr_for_pid(5), EIGHT_MB + FOUR_MB * 5);
    }

    #[test_case]
    fn page_table_entry_masks_low_bits_of_address() {
        let entry = page_table_entry(0x0010_0123, FLAG_PRESENT);
        assert_eq!(entry & ADDR_MASK, 0x0010_0000);
        assert_eq!(entry & FLAG_PRESENT, FLAG_PRESENT);
    }
}
