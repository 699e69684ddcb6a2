//! Address-space syscall handlers: `mmap`, `munmap`, `mprotect`.
//!
//! Thin wiring over [`kmm::mmap::MmapSpace`], which already owns the
//! range bookkeeping; these functions only locate the calling process's
//! space and translate the call's arguments into its shape.

use alloc::sync::Arc;

use kcore::addr::VirtAddr;
use kcore::errno::Errno;
use kmm::mmap::{MmapFlags, Prot};

use crate::process::Process;

/// `mmap(hint, len, prot, flags, fd, offset)`.
pub fn sys_mmap(process: &Arc<Process>, hint: VirtAddr, len: u64, prot: Prot, flags: MmapFlags, fd: Option<i32>, offset: u64) -> Result<VirtAddr, Errno> {
    if flags.contains(MmapFlags::ANONYMOUS) && fd.is_some() {
        return Err(Errno::EInval);
    }
    process.mmap_space.lock().mmap(hint, len, prot, flags, fd, offset)
}

/// `munmap(addr, len)`.
pub fn sys_munmap(process: &Arc<Process>, addr: VirtAddr, len: u64) -> Result<(), Errno> {
    process.mmap_space.lock().munmap(addr, len).map(|_| ())
}

/// `mprotect(addr, len, prot)`.
pub fn sys_mprotect(process: &Arc<Process>, addr: VirtAddr, len: u64, prot: Prot) -> Result<(), Errno> {
    process.mmap_space.lock().mprotect(addr, len, prot)
}
