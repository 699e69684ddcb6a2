//! `devfs`: the pseudo-filesystem exposing device nodes (`/dev/console`,
//! `/dev/null`, `/dev/zero`, and whatever a driver registers at attach
//! time) as ordinary VFS nodes backed by driver-supplied resources.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

use kcore::errno::Errno;
use kcore::sync::SpinLock;

use crate::resource::{Resource, ResourceRef};
use crate::stat::{Mode, Stat};
use crate::tmpfs::DirResource;
use crate::vfs::{FileSystem, Node, NodeKind};

/// `/dev/null`: discards writes, reads return EOF.
pub struct NullDevice;

impl Resource for NullDevice {
    fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize, Errno> {
        Ok(0)
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        Ok(buf.len())
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat::for_mode(0, Mode::CHAR_DEV))
    }
}

/// `/dev/zero`: reads return zero-filled bytes, writes are discarded.
pub struct ZeroDevice;

impl Resource for ZeroDevice {
    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        Ok(buf.len())
    }

    fn stat(&self) -> Result<Stat, Errno> {
        Ok(Stat::for_mode(0, Mode::CHAR_DEV))
    }
}

/// The `devfs` filesystem: a flat registry of named device resources,
/// materialized as nodes on mount and on subsequent registration.
pub struct Devfs {
    devices: SpinLock<BTreeMap<String, ResourceRef>>,
}

impl Devfs {
    /// Creates an empty `devfs` with the standard `null`/`zero` devices
    /// pre-registered.
    pub fn new() -> Arc<Self> {
        let devfs = Arc::new(Self {
            devices: SpinLock::new(BTreeMap::new()),
        });
        devfs.register("null", Arc::new(NullDevice));
        devfs.register("zero", Arc::new(ZeroDevice));
        devfs
    }

    /// Registers a device resource under `name`, for later exposure at
    /// `/dev/<name>`. Called by driver attach code (console, NVMe
    /// namespaces via `crates/storage`) once the underlying device is
    /// ready.
    pub fn register(&self, name: &str, resource: ResourceRef) {
        self.devices.lock().insert(name.to_string(), resource);
    }

    /// Materializes every currently registered device as a child node of
    /// `root`, called once right after `mount`.
    pub fn populate(self: &Arc<Self>, root: &Arc<Node>) {
        for (name, resource) in self.devices.lock().iter() {
            let node = Node::new(
                name.clone(),
                NodeKind::Device,
                Some(Arc::downgrade(root)),
                self.clone(),
                resource.clone(),
            );
            root.insert_child(name.clone(), node);
        }
    }
}

impl FileSystem for Devfs {
    fn name(&self) -> &str {
        "devfs"
    }

    fn create(&self, _parent: &Arc<Node>, _name: &str, _kind: NodeKind) -> Result<Arc<Node>, Errno> {
        // devfs nodes only ever come from driver registration, not from a
        // generic `create` syscall.
        Err(Errno::EPerm)
    }

    fn mount(
        &self,
        _target_parent: &Arc<Node>,
        _basename: &str,
        _source: Option<&Arc<Node>>,
    ) -> Result<Arc<Node>, Errno> {
        Ok(Node::new(
            "/".into(),
            NodeKind::Directory,
            None,
            Devfs::new(),
            Arc::new(DirResource::new(0)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_device_discards_writes_and_reads_eof() {
        let dev = NullDevice;
        assert_eq!(dev.write(0, b"data").unwrap(), 4);
        let mut buf = [0xFFu8; 4];
        assert_eq!(dev.read(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn zero_device_fills_buffer() {
        let dev = ZeroDevice;
        let mut buf = [0xFFu8; 8];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn registering_a_device_makes_it_retrievable() {
        let devfs = Devfs::new();
        devfs.register("console", Arc::new(NullDevice));
        assert!(devfs.devices.lock().contains_key("console"));
    }
}
