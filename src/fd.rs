//! Per-process file-descriptor table.
//!
//! Grounded in `filedescriptor.h` (`file_desc_t`/`file_desc_ftable_t`) and
//! `syscalls.c`'s `open`/`read`/`write`/`close`. The original dispatches
//! through a table of four function pointers (`file_regular_ftable`,
//! `file_dir_ftable`, `stdinout`, `rtc_ftable`); per spec.md §9's
//! operation-table design note, that becomes a tagged enum dispatched by
//! `match` instead.

use crate::fs::{self, FileType};
use crate::rtc;
use crate::terminal;

/// Fixed fd-table size (spec.md §3: "ordered fixed-size table of
/// MAX_FILE_DESCRIPTORS=8").
pub const MAX_FILE_DESCRIPTORS: usize = 8;

/// Which backend a descriptor is bound to.
#[derive(Clone, Copy)]
enum FdKind {
    Stdin,
    Stdout,
    Regular { inode: u32 },
    Directory,
    Rtc,
}

/// One entry of a process's fd table.
#[derive(Clone, Copy)]
struct FileDescriptor {
    kind: FdKind,
    pos: u32,
    open: bool,
}

/// A process's fd table, slots 0/1 reserved for stdin/stdout.
pub struct FdTable {
    entries: [Option<FileDescriptor>; MAX_FILE_DESCRIPTORS],
}

impl FdTable {
    /// A fresh table with fd 0 (stdin) and fd 1 (stdout) already open.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [
                Some(FileDescriptor { kind: FdKind::Stdin, pos: 0, open: true }),
                Some(FileDescriptor { kind: FdKind::Stdout, pos: 0, open: true }),
                None,
                None,
                None,
                None,
                None,
                None,
            ],
        }
    }

    /// Resolve `name` in the filesystem, allocate the lowest free slot at
    /// index ≥ 2, attach the matching backend, and mark it open only once
    /// the backend's open succeeds (spec.md §9 issue iv).
    pub fn open(&mut self, name: &[u8], terminal_index: usize) -> i32 {
        let Some(slot) = self.entries.iter().skip(2).position(Option::is_none) else {
            return -1;
        };
        let slot = slot + 2;

        let Some(dentry) = fs::with_fs(|f| f.read_dentry_by_name(name)) else {
            return -1;
        };
        let Ok(dentry) = dentry else {
            return -1;
        };
        let Some(file_type) = dentry.file_type else {
            return -1;
        };

        let kind = match file_type {
            FileType::Regular => {
                match fs::with_fs(|f| f.validate_regular_file(dentry.inode as u32)) {
                    Some(Ok(())) => {}
                    _ => return -1,
                }
                FdKind::Regular { inode: dentry.inode as u32 }
            }
            FileType::Directory => FdKind::Directory,
            FileType::Rtc => {
                rtc::rtc_open(terminal_index);
                FdKind::Rtc
            }
        };

        self.entries[slot] = Some(FileDescriptor { kind, pos: 0, open: true });
        slot as i32
    }

    /// Dispatch a read through `fd`'s backend.
    pub fn read(&mut self, fd: usize, buf: &mut [u8], terminal_index: usize) -> i32 {
        let Some(entry) = self.entry_mut(fd) else {
            return -1;
        };

        match entry.kind {
            FdKind::Stdin => terminal::read(buf),
            FdKind::Stdout => -1,
            FdKind::Regular { inode } => {
                let Some(read) = fs::with_fs(|f| f.read_data(inode, entry.pos, buf)) else {
                    return -1;
                };
                match read {
                    Ok(read) => {
                        entry.pos += read;
                        read as i32
                    }
                    Err(_) => -1,
                }
            }
            FdKind::Directory => {
                let Some(dentry) = fs::with_fs(|f| f.read_dentry_by_index(entry.pos)) else {
                    return -1;
                };
                match dentry {
                    Ok(dentry) => {
                        let name_len = dentry.name_len().min(buf.len());
                        buf[..name_len].copy_from_slice(&dentry.name[..name_len]);
                        if buf.len() > name_len {
                            buf[name_len] = 0;
                        }
                        entry.pos += 1;
                        name_len as i32
                    }
                    Err(_) => 0,
                }
            }
            FdKind::Rtc => rtc::rtc_read(terminal_index),
        }
    }

    /// Dispatch a write through `fd`'s backend.
    pub fn write(&mut self, fd: usize, buf: &[u8], terminal_index: usize) -> i32 {
        let Some(entry) = self.entry_mut(fd) else {
            return -1;
        };

        match entry.kind {
            FdKind::Stdin => -1,
            FdKind::Stdout => terminal::write(buf),
            FdKind::Regular { .. } | FdKind::Directory => -1,
            FdKind::Rtc => {
                if buf.len() < 4 {
                    return -1;
                }
                let freq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
                rtc::rtc_write(terminal_index, freq)
            }
        }
    }

    /// Close `fd`. Fds 0 and 1 may never be closed; closing an already-closed
    /// fd fails without modifying state.
    pub fn close(&mut self, fd: usize) -> i32 {
        if fd < 2 || fd >= MAX_FILE_DESCRIPTORS {
            return -1;
        }
        if self.entries[fd].is_none() {
            return -1;
        }
        self.entries[fd] = None;
        0
    }

    /// Close every open fd above 1, used by `halt`.
    pub fn close_all(&mut self) {
        for slot in self.entries.iter_mut().skip(2) {
            *slot = None;
        }
    }

    fn entry_mut(&mut self, fd: usize) -> Option<&mut FileDescriptor> {
        let entry = self.entries.get_mut(fd)?.as_mut()?;
        if entry.open { Some(entry) } else { None }
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn fresh_table_has_stdin_stdout_open() {
        let table = FdTable::new();
        assert!(table.entries[0].is_some());
        assert!(table.entries[1].is_some());
        assert!(table.entries[2..].iter().all(Option::is_none));
    }

    #[test_case]
    fn writing_to_stdin_fails() {
        let mut table = FdTable::new();
        assert_eq!(table.write(0, b"x", 0), -1);
    }

    #[test_case]
    fn closing_reserved_fds_fails() {
        let mut table = FdTable::new();
        assert_eq!(table.close(0), -1);
        assert_eq!(table.close(1), -1);
    }

    #[test_case]
    fn closing_closed_fd_fails() {
        let mut table = FdTable::new();
        assert_eq!(table.close(2), -1);
    }
}
