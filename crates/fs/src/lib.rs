//! Virtual file system: node tree, descriptor layer, and the `tmpfs`/
//! `devfs` pseudo-filesystems needed to drive it end-to-end.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod devfs;
pub mod fd;
pub mod resource;
pub mod stat;
pub mod tmpfs;
pub mod vfs;

pub use fd::{FdFlags, FdTable, OpenFileDescription, OpenFlags};
pub use resource::{Resource, ResourceRef};
pub use stat::{Mode, Stat};
pub use vfs::{FileSystem, Node, NodeKind, Vfs, MAX_SYMLINK_DEPTH};
