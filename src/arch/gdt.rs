//! 32-bit Global Descriptor Table and Task State Segment.
//!
//! The teacher's `gdt.rs` builds a 64-bit GDT/TSS through the `x86_64` crate;
//! that crate has no i386 mode, so this is a hand-rolled replacement that
//! keeps the same shape (static GDT, one TSS, `lazy_static`-free because the
//! table must be `'static` mutable data the CPU points directly at).

use core::arch::asm;
use core::mem::size_of;
use spin::Mutex;

use super::load_tss;

/// Kernel code segment selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data segment selector.
pub const KERNEL_DS: u16 = 0x10;
/// User code segment selector (RPL = 3).
pub const USER_CS: u16 = 0x18 | 3;
/// User data segment selector (RPL = 3).
pub const USER_DS: u16 = 0x20 | 3;
/// TSS selector.
const TSS_SELECTOR: u16 = 0x28;

const GDT_ENTRIES: usize = 6;

/// One 8-byte GDT descriptor, in the classic i386 layout.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    const fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (granularity & 0xF0) | (((limit >> 16) & 0x0F) as u8),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

/// The 104-byte i386 TSS. Only `esp0`/`ss0` are ever read by hardware in this
/// kernel, since there is no hardware task switching; the rest stays zeroed.
#[repr(C, packed)]
pub struct Tss {
    link: u16,
    _r0: u16,
    /// Ring-0 stack pointer loaded on a privilege-level change into the
    /// kernel; this is the field the scheduler and `execute`/`halt` save and
    /// restore per process.
    pub esp0: u32,
    /// Ring-0 stack segment, always [`KERNEL_DS`].
    pub ss0: u16,
    _r1: u16,
    esp1: u32,
    ss1: u16,
    _r2: u16,
    esp2: u32,
    ss2: u16,
    _r3: u16,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u16,
    _r4: u16,
    cs: u16,
    _r5: u16,
    ss: u16,
    _r6: u16,
    ds: u16,
    _r7: u16,
    fs: u16,
    _r8: u16,
    gs: u16,
    _r9: u16,
    ldt: u16,
    _r10: u16,
    trap: u16,
    iomap_base: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            link: 0,
            _r0: 0,
            esp0: 0,
            ss0: 0,
            _r1: 0,
            esp1: 0,
            ss1: 0,
            _r2: 0,
            esp2: 0,
            ss2: 0,
            _r3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            _r4: 0,
            cs: 0,
            _r5: 0,
            ss: 0,
            _r6: 0,
            ds: 0,
            _r7: 0,
            fs: 0,
            _r8: 0,
            gs: 0,
            _r9: 0,
            ldt: 0,
            _r10: 0,
            trap: 0,
            iomap_base: size_of::<Tss>() as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static GDT: Mutex<[GdtEntry; GDT_ENTRIES]> = Mutex::new([GdtEntry::null(); GDT_ENTRIES]);
/// Shared kernel TSS. There is exactly one, since the kernel never performs
/// a hardware task switch; software swaps `esp0` in and out of it per the
/// scheduler's co-routine model (spec.md §4.K).
pub static TSS: Mutex<Tss> = Mutex::new(Tss::new());

const ACCESS_KERNEL_CODE: u8 = 0x9A;
const ACCESS_KERNEL_DATA: u8 = 0x92;
const ACCESS_USER_CODE: u8 = 0xFA;
const ACCESS_USER_DATA: u8 = 0xF2;
const ACCESS_TSS: u8 = 0x89;
const GRANULARITY_4K_32BIT: u8 = 0xC0;
const GRANULARITY_BYTE: u8 = 0x00;

/// Build the GDT and TSS and load them into the CPU.
///
/// # Safety
/// Must run exactly once, early in boot, before any segment register reload
/// or `iret` to user mode.
pub unsafe fn init() {
    // SAFETY: takes the address of TSS's inner data, not of the Mutex
    // wrapper; spin::Mutex does not guarantee its data field sits at offset
    // 0, so the descriptor/selector must point at the former, not the latter.
    let tss_addr = core::ptr::addr_of!(*TSS.lock()) as u32;
    let tss_limit = (size_of::<Tss>() - 1) as u32;

    {
        let mut gdt = GDT.lock();
        gdt[0] = GdtEntry::null();
        gdt[1] = GdtEntry::new(0, 0x000F_FFFF, ACCESS_KERNEL_CODE, GRANULARITY_4K_32BIT);
        gdt[2] = GdtEntry::new(0, 0x000F_FFFF, ACCESS_KERNEL_DATA, GRANULARITY_4K_32BIT);
        gdt[3] = GdtEntry::new(0, 0x000F_FFFF, ACCESS_USER_CODE, GRANULARITY_4K_32BIT);
        gdt[4] = GdtEntry::new(0, 0x000F_FFFF, ACCESS_USER_DATA, GRANULARITY_4K_32BIT);
        gdt[5] = GdtEntry::new(tss_addr, tss_limit, ACCESS_TSS, GRANULARITY_BYTE);
    }

    {
        let mut tss = TSS.lock();
        tss.ss0 = KERNEL_DS;
    }

    // SAFETY: address of GDT's inner array, for the same reason as tss_addr
    // above; the GDT lock taken in the block above has already been
    // released by this point.
    let gdt_base = core::ptr::addr_of!(*GDT.lock()) as u32;
    let gdt_ptr = DescriptorTablePointer {
        limit: (size_of::<[GdtEntry; GDT_ENTRIES]>() - 1) as u16,
        base: gdt_base,
    };

    // SAFETY: gdt_ptr references the static GDT table above, which outlives
    // this call; reloading segment registers to known-good kernel selectors
    // immediately after `lgdt` is the standard sequence.
    unsafe {
        asm!(
            "lgdt [{0}]",
            in(reg) &gdt_ptr,
            options(readonly, nostack, preserves_flags),
        );
        reload_segments();
        load_tss(TSS_SELECTOR);
    }
}

/// Reload every segment register from the freshly-loaded GDT.
///
/// # Safety
/// Must run immediately after `lgdt` with a GDT that defines
/// [`KERNEL_CS`]/[`KERNEL_DS`].
unsafe fn reload_segments() {
    // SAFETY: far jump / segment loads into selectors just installed by init.
    unsafe {
        asm!(
            "push {code_sel}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ax, {data_sel:x}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            code_sel = const KERNEL_CS,
            tmp = out(reg) _,
            data_sel = in(reg) KERNEL_DS,
            out("eax") _,
            options(nostack),
        );
    }
}
