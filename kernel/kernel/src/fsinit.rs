//! Root filesystem assembly: a `tmpfs` root with `devfs` mounted at `/dev`.
//!
//! Real on-disk filesystems (ext2 over the NVMe block device) mount later,
//! once `kstorage` has attached a controller; this module only builds the
//! in-memory skeleton every other mount and every `openat` lookup needs to
//! exist from the first instruction after boot.

use alloc::sync::Arc;

use kfs::devfs::Devfs;
use kfs::tmpfs::Tmpfs;
use kfs::Vfs;

/// Builds the root `Vfs` with `tmpfs` as its root filesystem and `devfs`
/// populated under `/dev`.
#[must_use]
pub fn mount_root() -> Vfs {
    let tmpfs = Arc::new(Tmpfs::new());
    let root = tmpfs.new_root();
    let vfs = Vfs::new(root.clone());
    vfs.register_filesystem(tmpfs);

    let devfs = Devfs::new();
    vfs.register_filesystem(devfs.clone());
    let dev_node = vfs
        .create(&root, "dev", kfs::NodeKind::Directory)
        .expect("tmpfs root create cannot fail this early in boot");
    devfs.populate(&dev_node);

    vfs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_dev_null() {
        let vfs = mount_root();
        let root = vfs.root();
        let node = vfs.resolve("/dev/null", &root, true).unwrap();
        assert_eq!(node.kind, kfs::NodeKind::Device);
    }
}
