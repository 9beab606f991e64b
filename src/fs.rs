//! Read-only block filesystem.
//!
//! Grounded directly in `fs.c`/`fs.h`: a boot block, up to 63 directory
//! entries, then inodes, then raw 4 KB data blocks, all addressed relative
//! to a single base address handed to the kernel at boot.

use core::mem;
use spin::Mutex;

/// Length of a dentry's name field, including any non-terminated overflow.
pub const DENTRY_NAME_LEN: usize = 32;
const DATA_BLOCK_SIZE: u32 = 0x1000;
const DENTRY_START: usize = 64;
const MAX_DENTRIES: usize = 63;

/// A file's type, as stored in its dentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum FileType {
    /// Virtual real-time-clock device.
    Rtc = 0,
    /// Directory.
    Directory = 1,
    /// Regular file backed by data blocks.
    Regular = 2,
}

impl FileType {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Rtc),
            1 => Some(Self::Directory),
            2 => Some(Self::Regular),
            _ => None,
        }
    }
}

/// A single 64-byte directory entry.
#[derive(Clone, Copy)]
pub struct Dentry {
    /// Zero-padded name, not necessarily NUL-terminated at length 32.
    pub name: [u8; DENTRY_NAME_LEN],
    /// Parsed file type, or `None` if the on-disk value is unrecognized.
    pub file_type: Option<FileType>,
    /// Index into the inode region.
    pub inode: i32,
}

impl Dentry {
    /// Length of `name` up to the first NUL, or 32 if unterminated.
    #[must_use]
    pub fn name_len(&self) -> usize {
        self.name.iter().position(|&b| b == 0).unwrap_or(DENTRY_NAME_LEN)
    }
}

/// Errors the filesystem layer can report. Every syscall-facing caller
/// collapses these to `-1` at the ABI boundary (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No dentry matches the requested name or index.
    NotFound,
    /// An inode or data-block index fell outside the image's bounds.
    OutOfRange,
}

/// The parsed filesystem image: a base address plus the three boot-block
/// counts needed to bounds-check every lookup.
#[derive(Clone, Copy)]
pub struct FileSystem {
    base: u32,
    n_dentries: u32,
    n_inodes: u32,
    n_blocks: u32,
}

impl FileSystem {
    /// Parse the boot block at `base` (a physical address the bootloader
    /// handed to the kernel).
    ///
    /// # Safety
    /// `base` must point at a valid, readable filesystem image of at least
    /// one 4 KB block.
    #[must_use]
    pub unsafe fn from_base(base: u32) -> Self {
        // SAFETY: caller guarantees `base` points at a mapped boot block.
        let (n_dentries, n_inodes, n_blocks) = unsafe {
            let ptr = base as *const u32;
            (ptr.read_unaligned(), ptr.add(1).read_unaligned(), ptr.add(2).read_unaligned())
        };
        Self { base, n_dentries, n_inodes, n_blocks }
    }

    fn dentry_at(&self, index: usize) -> Dentry {
        // SAFETY: index is bounds-checked by every public caller before
        // this is reached.
        unsafe {
            let entry = (self.base as usize + DENTRY_START + index * 64) as *const u8;
            let mut name = [0_u8; DENTRY_NAME_LEN];
            core::ptr::copy_nonoverlapping(entry, name.as_mut_ptr(), DENTRY_NAME_LEN);
            let type_ptr = entry.add(DENTRY_NAME_LEN) as *const i32;
            let file_type = FileType::from_raw(type_ptr.read_unaligned());
            let inode = type_ptr.add(1).read_unaligned();
            Dentry { name, file_type, inode }
        }
    }

    fn inode_ptr(&self, id: u32) -> Option<*const u32> {
        if id >= self.n_inodes {
            return None;
        }
        Some((self.base + (id + 1) * DATA_BLOCK_SIZE) as *const u32)
    }

    fn block_ptr(&self, id: u32) -> Option<*const u8> {
        if id >= self.n_blocks {
            return None;
        }
        Some((self.base + (id + self.n_inodes + 1) * DATA_BLOCK_SIZE) as *const u8)
    }

    /// Linear scan of up to 63 dentries for a name match. First match wins.
    pub fn read_dentry_by_name(&self, name: &[u8]) -> Result<Dentry, FsError> {
        let want_len = name.iter().position(|&b| b == 0).unwrap_or(name.len()).min(DENTRY_NAME_LEN);
        let max = (self.n_dentries as usize).min(MAX_DENTRIES);
        for i in 0..max {
            let dentry = self.dentry_at(i);
            if dentry.name_len() == want_len && dentry.name[..want_len] == name[..want_len] {
                return Ok(dentry);
            }
        }
        Err(FsError::NotFound)
    }

    /// Bounds-checked direct lookup by directory index.
    pub fn read_dentry_by_index(&self, index: u32) -> Result<Dentry, FsError> {
        let max = (self.n_dentries as usize).min(MAX_DENTRIES);
        if index as usize >= max {
            return Err(FsError::NotFound);
        }
        Ok(self.dentry_at(index as usize))
    }

    /// Read up to `buf.len()` bytes from `inode` starting at `offset`.
    /// Clips to the file's recorded size; returns the number of bytes
    /// actually copied.
    pub fn read_data(&self, inode: u32, offset: u32, buf: &mut [u8]) -> Result<u32, FsError> {
        let inode_ptr = self.inode_ptr(inode).ok_or(FsError::OutOfRange)?;
        // SAFETY: inode_ptr was bounds-checked against n_inodes above.
        let file_size = unsafe { inode_ptr.read_unaligned() };

        if offset >= file_size {
            return Ok(0);
        }

        let mut length = buf.len() as u32;
        if length > file_size - offset {
            length = file_size - offset;
        }

        let mut block_num = offset / DATA_BLOCK_SIZE;
        let mut block_offset = offset % DATA_BLOCK_SIZE;
        let mut count = 0_u32;

        while count < length {
            // SAFETY: inode_ptr points at a 4 KB region; index 0 is the
            // size field, so block indices start at offset 1 word.
            let block_index = unsafe { inode_ptr.add(1 + block_num as usize).read_unaligned() };
            let block = self.block_ptr(block_index).ok_or(FsError::OutOfRange)?;

            let mut read_len = length - count;
            if read_len > DATA_BLOCK_SIZE - block_offset {
                read_len = DATA_BLOCK_SIZE - block_offset;
            }

            // SAFETY: block was bounds-checked against n_blocks; read_len
            // never exceeds the remaining space in the 4 KB block.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    block.add(block_offset as usize),
                    buf.as_mut_ptr().add(count as usize),
                    read_len as usize,
                );
            }

            count += read_len;
            block_num += 1;
            block_offset = 0;
        }

        Ok(count)
    }

    /// Maximum in-range inode used to validate every block index up front,
    /// matching `file_open`'s bounds-check-before-use discipline.
    pub fn validate_regular_file(&self, inode: u32) -> Result<(), FsError> {
        let inode_ptr = self.inode_ptr(inode).ok_or(FsError::OutOfRange)?;
        // SAFETY: inode_ptr is in range.
        let size = unsafe { inode_ptr.read_unaligned() };
        let num_blocks = size.div_ceil(DATA_BLOCK_SIZE);
        for i in 0..num_blocks {
            // SAFETY: i < num_blocks <= 1023, within the inode's index array.
            let block_index = unsafe { inode_ptr.add(1 + i as usize).read_unaligned() };
            self.block_ptr(block_index).ok_or(FsError::OutOfRange)?;
        }
        Ok(())
    }
}

const _: () = assert!(mem::size_of::<Dentry>() >= DENTRY_NAME_LEN);

static FILESYSTEM: Mutex<Option<FileSystem>> = Mutex::new(None);

/// Parse and install the filesystem image found at `base`. Called once from
/// `kernel_main` with the address the bootloader reported for the
/// filesystem module.
///
/// # Safety
/// `base` must point at a valid filesystem image for the lifetime of the
/// kernel.
pub unsafe fn init(base: u32) {
    // SAFETY: delegates to FileSystem::from_base under the same contract.
    let parsed = unsafe { FileSystem::from_base(base) };
    *FILESYSTEM.lock() = Some(parsed);
}

/// Run `f` against the installed filesystem, or return `None` if
/// [`init`] has not run yet.
pub fn with_fs<R>(f: impl FnOnce(&FileSystem) -> R) -> Option<R> {
    FILESYSTEM.lock().as_ref().map(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_image(buf: &mut [u8], dentries: &[(&str, FileType, i32)], file_bytes: &[u8]) -> u32 {
        let base = buf.as_mut_ptr() as u32;
        buf[0..4].copy_from_slice(&(dentries.len() as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&1_u32.to_le_bytes());
        buf[8..12].copy_from_slice(&1_u32.to_le_bytes());

        for (i, (name, ty, inode)) in dentries.iter().enumerate() {
            let off = DENTRY_START + i * 64;
            let name_bytes = name.as_bytes();
            buf[off..off + name_bytes.len()].copy_from_slice(name_bytes);
            buf[off + 32..off + 36].copy_from_slice(&(*ty as i32).to_le_bytes());
            buf[off + 36..off + 40].copy_from_slice(&inode.to_le_bytes());
        }

        let inode_off = 4096;
        buf[inode_off..inode_off + 4].copy_from_slice(&(file_bytes.len() as u32).to_le_bytes());
        buf[inode_off + 4..inode_off + 8].copy_from_slice(&0_u32.to_le_bytes());

        let block_off = 4096 * 2;
        buf[block_off..block_off + file_bytes.len()].copy_from_slice(file_bytes);

        base
    }

    #[test_case]
    fn read_dentry_by_name_finds_exact_match() {
        let mut buf = [0_u8; 4096 * 3];
        let base = build_image(&mut buf, &[("hello.txt", FileType::Regular, 0)], b"hi");
        // SAFETY: base points at the freshly built image above.
        let fs = unsafe { FileSystem::from_base(base) };
        let dentry = fs.read_dentry_by_name(b"hello.txt\0").expect("dentry should be found");
        assert_eq!(dentry.file_type, Some(FileType::Regular));
    }

    #[test_case]
    fn read_dentry_by_name_fails_on_unknown_name() {
        let mut buf = [0_u8; 4096 * 3];
        let base = build_image(&mut buf, &[("hello.txt", FileType::Regular, 0)], b"hi");
        // SAFETY: base points at the freshly built image above.
        let fs = unsafe { FileSystem::from_base(base) };
        assert_eq!(fs.read_dentry_by_name(b"missing\0"), Err(FsError::NotFound));
    }

    #[test_case]
    fn read_data_clips_to_file_size() {
        let mut buf = [0_u8; 4096 * 3];
        let base = build_image(&mut buf, &[("f", FileType::Regular, 0)], b"hello");
        // SAFETY: base points at the freshly built image above.
        let fs = unsafe { FileSystem::from_base(base) };
        let mut out = [0_u8; 10];
        let read = fs.read_data(0, 0, &mut out).expect("read should succeed");
        assert_eq!(read, 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test_case]
    fn read_data_at_eof_returns_zero() {
        let mut buf = [0_u8; 4096 * 3];
        let base = build_image(&mut buf, &[("f", FileType::Regular, 0)], b"hello");
        // SAFETY: base points at the freshly built image above.
        let fs = unsafe { FileSystem::from_base(base) };
        let mut out = [0_u8; 10];
        let read = fs.read_data(0, 5, &mut out).expect("read at eof should succeed");
        assert_eq!(read, 0);
    }
}
