//! The descriptor layer: open-file descriptions and the per-process fd
//! table, kept distinct from the [`crate::resource::Resource`] a
//! description ultimately refers to and from the small integer a process
//! uses to name it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;

use crate::resource::ResourceRef;
use crate::vfs::Node;

bitflags::bitflags! {
    /// Flags passed to `openat`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const RDONLY    = 0;
        /// Open for writing.
        const WRONLY    = 1 << 0;
        /// Open for both reading and writing.
        const RDWR      = 1 << 1;
        /// Create the file if it does not exist.
        const CREAT     = 1 << 2;
        /// Truncate an existing regular file to zero length.
        const TRUNC     = 1 << 3;
        /// Fail unless the resolved path is a directory.
        const DIRECTORY = 1 << 4;
        /// Fail if the final component is a symlink, instead of following it.
        const NOFOLLOW  = 1 << 5;
        /// Close this descriptor across `execve`.
        const CLOEXEC   = 1 << 6;
    }
}

/// The status flags and offset shared by every `fdnum` that `dup`s the same
/// `open()` call.
struct OpenFileDescriptionInner {
    offset: u64,
    flags: OpenFlags,
}

/// One logical `open()`: owns the seek offset and status flags, shared by
/// every fd number created from it via `dup`/`fork`.
pub struct OpenFileDescription {
    /// The node this description was opened against.
    pub node: Arc<Node>,
    /// The resource backing reads/writes.
    pub resource: ResourceRef,
    inner: SpinLock<OpenFileDescriptionInner>,
}

impl OpenFileDescription {
    /// Creates a new description at offset 0.
    pub fn new(node: Arc<Node>, resource: ResourceRef, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            node,
            resource,
            inner: SpinLock::new(OpenFileDescriptionInner { offset: 0, flags }),
        })
    }

    /// Reads from the current offset, advancing it by the amount read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        let mut inner = self.inner.lock();
        let n = self.resource.read(inner.offset, buf)?;
        inner.offset += n as u64;
        Ok(n)
    }

    /// Writes at the current offset, advancing it by the amount written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        let mut inner = self.inner.lock();
        let n = self.resource.write(inner.offset, buf)?;
        inner.offset += n as u64;
        Ok(n)
    }

    /// Returns the current seek offset.
    pub fn offset(&self) -> u64 {
        self.inner.lock().offset
    }

    /// Sets the seek offset directly (`lseek`).
    pub fn set_offset(&self, offset: u64) {
        self.inner.lock().offset = offset;
    }

    /// Returns the status flags this description was opened with.
    pub fn flags(&self) -> OpenFlags {
        self.inner.lock().flags
    }
}

bitflags::bitflags! {
    /// Per-fd-slot flags, distinct from the shared description's status
    /// flags. Only `CLOEXEC` exists at this layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Close this fd number (but not the underlying description,
        /// unless it was the last reference) across `execve`.
        const CLOEXEC = 1 << 0;
    }
}

struct FdSlot {
    description: Arc<OpenFileDescription>,
    flags: FdFlags,
}

/// A process's small-integer file descriptor table.
pub struct FdTable {
    slots: SpinLock<Vec<Option<FdSlot>>>,
}

impl FdTable {
    /// Creates an empty fd table.
    pub const fn new() -> Self {
        Self {
            slots: SpinLock::new(Vec::new()),
        }
    }

    /// Inserts `description` into the smallest free slot, or at `at` if
    /// the caller requested a specific index (`dup2`-style). Returns the
    /// assigned fd number.
    pub fn insert(
        &self,
        description: Arc<OpenFileDescription>,
        flags: FdFlags,
        at: Option<i32>,
    ) -> i32 {
        let mut slots = self.slots.lock();
        let slot = FdSlot { description, flags };
        if let Some(at) = at {
            let at = at as usize;
            if slots.len() <= at {
                slots.resize_with(at + 1, || None);
            }
            slots[at] = Some(slot);
            return at as i32;
        }
        for (i, s) in slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = Some(slot);
                return i as i32;
            }
        }
        slots.push(Some(slot));
        (slots.len() - 1) as i32
    }

    /// Returns the description for `fd`, if open.
    pub fn get(&self, fd: i32) -> Result<Arc<OpenFileDescription>, Errno> {
        if fd < 0 {
            return Err(Errno::EBadf);
        }
        let slots = self.slots.lock();
        slots
            .get(fd as usize)
            .and_then(|s| s.as_ref())
            .map(|s| s.description.clone())
            .ok_or(Errno::EBadf)
    }

    /// Closes `fd`, freeing its slot for reuse. Dropping the last `Arc` to
    /// a description's resource triggers `Resource::unref` via the
    /// resource's own `Drop`/refcounting, which this layer does not need
    /// to invoke directly.
    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        if fd < 0 {
            return Err(Errno::EBadf);
        }
        let mut slots = self.slots.lock();
        match slots.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Errno::EBadf),
        }
    }

    /// Duplicates `fd` into the smallest free slot (or `at`, for `dup2`),
    /// sharing the same description.
    pub fn dup(&self, fd: i32, at: Option<i32>) -> Result<i32, Errno> {
        let description = self.get(fd)?;
        Ok(self.insert(description, FdFlags::empty(), at))
    }

    /// Returns a fresh table sharing every description with this one,
    /// clearing `CLOEXEC` slots per `fork` semantics is the caller's job at
    /// `execve` time, not here.
    pub fn fork(&self) -> Self {
        let slots = self.slots.lock();
        let cloned = slots
            .iter()
            .map(|s| {
                s.as_ref().map(|slot| FdSlot {
                    description: slot.description.clone(),
                    flags: slot.flags,
                })
            })
            .collect();
        Self {
            slots: SpinLock::new(cloned),
        }
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
    use crate::tmpfs::{DirResource, Tmpfs};
    use crate::vfs::NodeKind;

    fn test_description() -> Arc<OpenFileDescription> {
        let tmpfs = Arc::new(Tmpfs::new());
        let node = Node::new(
            "f".into(),
            NodeKind::Regular,
            None,
            tmpfs,
            Arc::new(DirResource::new(1)),
        );
        OpenFileDescription::new(node.clone(), node.resource.clone(), OpenFlags::RDWR)
    }

    #[test]
    fn insert_picks_smallest_free_slot() {
        let table = FdTable::new();
        let a = table.insert(test_description(), FdFlags::empty(), None);
        let b = table.insert(test_description(), FdFlags::empty(), None);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        table.close(0).unwrap();
        let c = table.insert(test_description(), FdFlags::empty(), None);
        assert_eq!(c, 0);
    }

    #[test]
    fn get_on_closed_fd_is_ebadf() {
        let table = FdTable::new();
        assert_eq!(table.get(3).unwrap_err(), Errno::EBadf);
    }

    #[test]
    fn dup_shares_the_same_description() {
        let table = FdTable::new();
        let a = table.insert(test_description(), FdFlags::empty(), None);
        let b = table.dup(a, None).unwrap();
        assert!(Arc::ptr_eq(&table.get(a).unwrap(), &table.get(b).unwrap()));
    }

    #[test]
    fn insert_at_specific_index_grows_table() {
        let table = FdTable::new();
        let fd = table.insert(test_description(), FdFlags::empty(), Some(5));
        assert_eq!(fd, 5);
        assert!(table.get(5).is_ok());
    }
}
