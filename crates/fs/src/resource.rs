//! `Resource`: the underlying object a VFS node or file descriptor refers
//! to, independent of how many descriptions or fd numbers point at it.

use alloc::sync::Arc;

use kcore::errno::Errno;

use crate::stat::Stat;

/// The object behind a VFS node: a tmpfs file's byte buffer, a devfs
/// device's driver hooks, a pipe's ring buffer, or (via `crates/storage`)
/// a block device's cache.
pub trait Resource: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the
    /// number of bytes actually read (0 at end-of-file).
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Writes `buf` starting at `offset`, returning the number of bytes
    /// actually written.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno>;

    /// Returns this resource's current metadata.
    fn stat(&self) -> Result<Stat, Errno>;

    /// Returns the physical page backing `file_page` for an mmap fault,
    /// allocating and populating it from the underlying object if needed.
    /// Resources that do not support mmap (most devfs nodes) return
    /// `ENODEV`.
    fn mmap(&self, _file_page: u64, _writable: bool) -> Result<kcore::addr::PhysAddr, Errno> {
        Err(Errno::ENoDev)
    }

    /// Called when the last reference (VFS node entry, or open
    /// description) to this resource is dropped, so device/pipe resources
    /// can release any backing allocation.
    fn unref(&self) {}

    /// Truncates or extends a regular file's backing storage to `len`
    /// bytes. Non-regular resources return `EInval`.
    fn truncate(&self, _len: u64) -> Result<(), Errno> {
        Err(Errno::EInval)
    }
}

/// Reference-counted handle to a [`Resource`].
pub type ResourceRef = Arc<dyn Resource>;
