//! POSIX-shaped `stat` result, consumed by the `stat`/`fstat` syscalls.

bitflags::bitflags! {
    /// File type and permission bits (the `st_mode` word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Mode: u32 {
        /// Regular file.
        const REGULAR    = 0o100000;
        /// Directory.
        const DIRECTORY  = 0o040000;
        /// Symbolic link.
        const SYMLINK    = 0o120000;
        /// Character device.
        const CHAR_DEV   = 0o020000;
        /// Owner read permission.
        const OWNER_READ  = 0o400;
        /// Owner write permission.
        const OWNER_WRITE = 0o200;
        /// Owner execute permission.
        const OWNER_EXEC  = 0o100;
    }
}

/// Mirrors the fields of POSIX `struct stat` that this kernel's filesystems
/// actually populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// Inode number, unique within its filesystem.
    pub ino: u64,
    /// File type and permission bits.
    pub mode: Mode,
    /// Number of hard links.
    pub nlink: u32,
    /// File size in bytes (0 for non-regular files).
    pub size: u64,
    /// Preferred I/O block size.
    pub blksize: u32,
    /// Number of 512-byte blocks allocated.
    pub blocks: u64,
}

impl Stat {
    /// A zeroed stat result with the given mode, for pseudo-filesystem
    /// nodes that track no real size or link count.
    pub const fn for_mode(ino: u64, mode: Mode) -> Self {
        Self {
            ino,
            mode,
            nlink: 1,
            size: 0,
            blksize: 4096,
            blocks: 0,
        }
    }
}
