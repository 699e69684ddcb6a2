//! Page-table mapping primitives: flags, flush tracking, and the mapper
//! trait implemented by [`crate::vmm::AddressSpace`].

use core::sync::atomic::{AtomicPtr, Ordering};

use kcore::addr::VirtAddr;

bitflags::bitflags! {
    /// Permission and caching flags for a single mapping, independent of the
    /// raw [`kcore::paging::PageTableFlags`] bit layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page may be executed (absence sets `NO_EXECUTE`).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Page is global (not flushed on a CR3 switch).
        const GLOBAL        = 1 << 3;
        /// Disable caching for this page (MMIO regions).
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Error returned by [`crate::vmm::AddressSpace::unmap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmapError {
    /// No mapping exists at the given address.
    NotMapped,
    /// A mapping exists but does not cover the full requested size (huge
    /// page partially overlapping a 4 KiB unmap request).
    SizeMismatch,
}

/// Registered architecture callback invalidating a single TLB entry.
static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the architecture-specific single-page TLB invalidation routine
/// (`invlpg` on x86_64). Must be called once during boot before any
/// [`MapFlush::flush`] call.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

fn arch_flush_page(addr: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only a value stored by `register_tlb_flush`, which took a
        // `fn(VirtAddr)`, is ever placed here.
        let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
        f(addr);
    }
}

/// A pending TLB invalidation for one page, produced by a mapping mutation.
///
/// Callers that are about to issue several mutations in a row (e.g. mapping
/// a whole mmap range) can [`ignore`](MapFlush::ignore) each individual
/// flush and perform one full TLB flush at the end instead.
#[must_use = "a MapFlush must be flushed or explicitly ignored"]
pub struct MapFlush {
    addr: VirtAddr,
    flushed: bool,
}

impl MapFlush {
    pub(crate) fn new(addr: VirtAddr) -> Self {
        Self {
            addr,
            flushed: false,
        }
    }

    /// Invalidates the TLB entry for this page now.
    pub fn flush(mut self) {
        arch_flush_page(self.addr);
        self.flushed = true;
    }

    /// Discards the flush, asserting the caller will invalidate the TLB
    /// some other way (e.g. a full CR3 reload).
    pub fn ignore(mut self) {
        self.flushed = true;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        debug_assert!(
            self.flushed,
            "MapFlush for {:?} dropped without flush() or ignore()",
            self.addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_marks_handled() {
        let flush = MapFlush::new(VirtAddr::new(0x1000));
        flush.flush();
    }

    #[test]
    fn ignore_marks_handled() {
        let flush = MapFlush::new(VirtAddr::new(0x2000));
        flush.ignore();
    }
}
