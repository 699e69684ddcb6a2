//! `tmpfs`: a RAM-resident pseudo-filesystem. Every file's contents live in
//! a heap buffer owned by its resource; nothing is backed by a disk image,
//! so `mount`'s `source` argument is always ignored.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;

use crate::resource::Resource;
use crate::stat::{Mode, Stat};
use crate::vfs::{FileSystem, Node, NodeKind};

/// A resource with no content and no storage, used for symlinks (whose
/// target lives on the [`Node`] itself) and other metadata-only entries.
pub struct EmptyResource;

impl Resource for EmptyResource {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Ok(0)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EInval)
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat::for_mode(0, Mode::SYMLINK))
    }
}

/// A resource with no content, used for directories (whose children live
/// in the [`Node`] tree, not in any resource).
pub struct DirResource {
    ino: u64,
}

impl DirResource {
    /// Creates a directory resource with the given inode number.
    pub const fn new(ino: u64) -> Self {
        Self { ino }
    }
}

impl Resource for DirResource {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Err(Errno::EIsDir)
    }

    fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize, Errno> {
        Err(Errno::EIsDir)
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat::for_mode(self.ino, Mode::DIRECTORY))
    }
}

/// A regular tmpfs file: its entire content lives in a growable byte
/// buffer guarded by a spinlock.
pub struct TmpfsFile {
    ino: u64,
    data: SpinLock<Vec<u8>>,
}

impl Resource for TmpfsFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stat(&self) -> Result<Stat, Errno> {
        let mut stat = Stat::for_mode(self.ino, Mode::REGULAR);
        stat.size = self.data.lock().len() as u64;
        Ok(stat)
    }

    fn truncate(&self, len: u64) -> Result<(), Errno> {
        self.data.lock().resize(len as usize, 0);
        Ok(())
    }
}

/// The `tmpfs` filesystem implementation.
pub struct Tmpfs {
    next_ino: core::sync::atomic::AtomicU64,
}

impl Tmpfs {
    /// Creates a `tmpfs` instance with inode allocation starting at 1.
    pub const fn new() -> Self {
        Self {
            next_ino: core::sync::atomic::AtomicU64::new(1),
        }
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, core::sync::atomic::Ordering::Relaxed)
    }

    /// Builds a standalone root node for a fresh `tmpfs` mount (or the VFS
    /// root itself at boot).
    pub fn new_root(self: &Arc<Self>) -> Arc<Node> {
        let ino = self.alloc_ino();
        Node::new(
            "/".into(),
            NodeKind::Directory,
            None,
            self.clone(),
            Arc::new(DirResource { ino }),
        )
    }
}

impl Default for Tmpfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for Tmpfs {
    fn name(&self) -> &str {
        "tmpfs"
    }

    fn create(&self, parent: &Arc<Node>, name: &str, kind: NodeKind) -> Result<Arc<Node>, Errno> {
        let ino = self.alloc_ino();
        let resource: Arc<dyn Resource> = match kind {
            NodeKind::Directory => Arc::new(DirResource { ino }),
            NodeKind::Regular => Arc::new(TmpfsFile {
                ino,
                data: SpinLock::new(Vec::new()),
            }),
            NodeKind::Symlink => Arc::new(EmptyResource),
            NodeKind::Device => return Err(Errno::EInval),
        };
        Ok(Node::new(
            name.into(),
            kind,
            Some(Arc::downgrade(parent)),
            parent.filesystem.clone(),
            resource,
        ))
    }

    fn mount(
        &self,
        _target_parent: &Arc<Node>,
        _basename: &str,
        _source: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, Errno> {
        let ino = self.alloc_ino();
        Ok(Node::new(
            "/".into(),
            NodeKind::Directory,
            None,
            Arc::new(Tmpfs::new()),
            Arc::new(DirResource { ino }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_write_then_read_roundtrips() {
        let file = TmpfsFile {
            ino: 1,
            data: SpinLock::new(Vec::new()),
        };
        file.write(0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = file.read(0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_past_end_returns_zero() {
        let file = TmpfsFile {
            ino: 1,
            data: SpinLock::new(Vec::new()),
        };
        let mut buf = [0u8; 4];
        assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn truncate_shrinks_reported_size() {
        let file = TmpfsFile {
            ino: 1,
            data: SpinLock::new(alloc::vec![1, 2, 3, 4]),
        };
        file.truncate(2).unwrap();
        assert_eq!(file.stat().unwrap().size, 2);
    }
}
