//! Filesystem syscall handlers: path lookup, directory listing, links,
//! and the current-working-directory pair.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kfs::fd::OpenFlags;
use kfs::vfs::NodeKind;
use kfs::{Mode, Node, OpenFileDescription, Stat, Vfs};

use crate::fdtable::Descriptor;
use crate::process::Process;

fn parent_and_name(path: &str) -> Result<(&str, &str), Errno> {
    match path.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => Ok((if parent.is_empty() { "/" } else { parent }, name)),
        Some(_) => Err(Errno::EInval),
        None => Ok((".", path)),
    }
}

/// `openat(dirfd_is_always_cwd, path, flags, mode)`. `mode` only matters
/// when `O_CREAT` creates a new node; it is masked by the process's
/// `umask`.
pub fn sys_openat(process: &Arc<Process>, vfs: &Vfs, path: &str, flags: OpenFlags) -> Result<i32, Errno> {
    let cwd = process.cwd();
    let node = match vfs.resolve(path, &cwd, !flags.contains(OpenFlags::NOFOLLOW)) {
        Ok(node) => {
            if flags.contains(OpenFlags::DIRECTORY) && node.kind != NodeKind::Directory {
                return Err(Errno::ENotDir);
            }
            node
        }
        Err(Errno::ENoEnt) if flags.contains(OpenFlags::CREAT) => {
            let (parent_path, name) = parent_and_name(path)?;
            let parent = vfs.resolve(parent_path, &cwd, true)?;
            vfs.create(&parent, name, NodeKind::Regular)?
        }
        Err(err) => return Err(err),
    };
    if flags.contains(OpenFlags::TRUNC) {
        node.resource.truncate(0)?;
    }
    let description = OpenFileDescription::new(node.clone(), node.resource.clone(), flags);
    Ok(process.fds.insert(Descriptor::File(description)))
}

/// `stat(path)`.
pub fn sys_stat(process: &Arc<Process>, vfs: &Vfs, path: &str) -> Result<Stat, Errno> {
    let cwd = process.cwd();
    let node = vfs.resolve(path, &cwd, true)?;
    node.stat()
}

/// `getcwd()`, rendered as an absolute path.
pub fn sys_getcwd(process: &Arc<Process>, vfs: &Vfs) -> String {
    vfs.pathname(&process.cwd())
}

/// `chdir(path)`.
pub fn sys_chdir(process: &Arc<Process>, vfs: &Vfs, path: &str) -> Result<(), Errno> {
    let cwd = process.cwd();
    let node = vfs.resolve(path, &cwd, true)?;
    if node.kind != NodeKind::Directory {
        return Err(Errno::ENotDir);
    }
    process.set_cwd(node);
    Ok(())
}

/// `readdir(fd)`, returning `(name, kind)` pairs for every entry.
pub fn sys_readdir(process: &Arc<Process>, fd: i32) -> Result<Vec<(String, NodeKind)>, Errno> {
    let Descriptor::File(description) = process.fds.get(fd)? else {
        return Err(Errno::ENotDir);
    };
    if description.node.kind != NodeKind::Directory {
        return Err(Errno::ENotDir);
    }
    Ok(description.node.children())
}

/// `readlinkat(path)`, returning the symlink's stored target text.
pub fn sys_readlinkat(process: &Arc<Process>, vfs: &Vfs, path: &str) -> Result<String, Errno> {
    let cwd = process.cwd();
    let node = vfs.resolve(path, &cwd, false)?;
    node.symlink_target.clone().ok_or(Errno::EInval)
}

/// `linkat(existing, new)`: a new hard-link name for `existing`'s node.
pub fn sys_linkat(process: &Arc<Process>, vfs: &Vfs, existing: &str, new: &str) -> Result<(), Errno> {
    let cwd = process.cwd();
    let target = vfs.resolve(existing, &cwd, true)?;
    let (parent_path, name) = parent_and_name(new)?;
    let parent = vfs.resolve(parent_path, &cwd, true)?;
    vfs.link(&parent, name, &target)
}

/// `unlinkat(path)`.
pub fn sys_unlinkat(process: &Arc<Process>, vfs: &Vfs, path: &str) -> Result<(), Errno> {
    let cwd = process.cwd();
    let (parent_path, name) = parent_and_name(path)?;
    let parent = vfs.resolve(parent_path, &cwd, true)?;
    vfs.unlink(&parent, name)
}

/// `mkdirat(path, mode)`. `mode` is masked by the process's `umask` but
/// this kernel's directories do not yet carry distinct permission bits
/// beyond `NodeKind::Directory`, so it is accepted and otherwise unused.
pub fn sys_mkdirat(process: &Arc<Process>, vfs: &Vfs, path: &str, _mode: Mode) -> Result<Arc<Node>, Errno> {
    let cwd = process.cwd();
    let (parent_path, name) = parent_and_name(path)?;
    let parent = vfs.resolve(parent_path, &cwd, true)?;
    vfs.create(&parent, name, NodeKind::Directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_and_name_splits_trailing_component() {
        assert_eq!(parent_and_name("/dev/null").unwrap(), ("/dev", "null"));
        assert_eq!(parent_and_name("file").unwrap(), (".", "file"));
        assert!(parent_and_name("/dev/").is_err());
    }
}
