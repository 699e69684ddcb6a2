//! mmap range tracking: the global/local range model used to resolve page
//! faults and to answer `mmap`/`mprotect`/`munmap`/`fork` without walking
//! every page table entry.
//!
//! A mapping is split into two layers. A [`GlobalRange`] is the canonical,
//! address-space-independent state of one logical mapping: its backing
//! resource and the shadow page map of physical frames that have actually
//! been faulted in for it. A [`MmapRange`] is one address space's local view
//! of a (possibly narrowed, by `mprotect` splitting) slice of a global range
//! — its own protection bits and flags, sharing the global's `Arc` so that
//! `MAP_SHARED` mappings across a `fork()` see the same physical pages.
//!
//! Each process address space owns a sorted list of non-overlapping
//! [`MmapRange`]s. A page fault looks up the local range covering the
//! faulting address and consults it (rather than the page tables) to decide
//! whether the fault is a first-touch allocation, a file-backed page-in, or
//! a genuine protection violation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::addr::{PhysAddr, VirtAddr};
use kcore::errno::Errno;
use kcore::sync::SpinLock;

use crate::pmm::Pmm;

const PAGE_SIZE: u64 = 4096;

bitflags::bitflags! {
    /// Requested page protection, independent of [`crate::mapper::MapFlags`]
    /// (which also encodes caching and privilege, not just rwx).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Pages may be read.
        const READ  = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    /// `mmap` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Not backed by a file; zero-filled on first touch.
        const ANONYMOUS = 1 << 0;
        /// Changes are visible to other mappers of the same backing object.
        const SHARED    = 1 << 1;
        /// Changes are private to this mapping (copy-on-write from the
        /// backing object or from the parent on fork).
        const PRIVATE   = 1 << 2;
        /// Caller supplied a hint address that must be honored exactly.
        const FIXED     = 1 << 3;
    }
}

/// The canonical, address-space-independent state of one logical mapping.
///
/// `shadow` maps a page index relative to `base` (`(addr - base) / 4096`) to
/// the physical frame backing it, populated lazily as pages are faulted in.
/// Every [`MmapRange`] that is a view onto this mapping shares one
/// `Arc<SpinLock<GlobalRange>>`; for `MAP_SHARED` ranges that sharing
/// survives `fork()`, for `MAP_PRIVATE` ranges `fork()` builds a fresh
/// global with its own copied shadow.
pub struct GlobalRange {
    /// Page-aligned start address this global range was created at.
    pub base: VirtAddr,
    /// Length in bytes, a multiple of the page size.
    pub len: u64,
    /// Offset into the backing resource at `base`.
    pub file_offset: u64,
    /// File descriptor backing this range, or `None` for anonymous.
    pub resource_fd: Option<i32>,
    /// Physical frames faulted in so far, keyed by page index from `base`.
    pub shadow: BTreeMap<u64, PhysAddr>,
}

/// One address space's view of a slice of a [`GlobalRange`].
#[derive(Clone)]
pub struct MmapRange {
    /// Page-aligned start address of this local view.
    pub base: VirtAddr,
    /// Length in bytes, a multiple of the page size.
    pub len: u64,
    /// Current protection, local to this address space.
    pub prot: Prot,
    /// Original request flags.
    pub flags: MmapFlags,
    /// Offset into the backing resource at `base` (may differ from the
    /// parent global's `file_offset` after an `mprotect` split).
    pub file_offset: u64,
    /// The global range this local view shares ownership of.
    pub global: Arc<SpinLock<GlobalRange>>,
}

impl MmapRange {
    /// Returns `true` if `addr` falls within `[base, base + len)`.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        let a = addr.as_u64();
        let b = self.base.as_u64();
        a >= b && a < b + self.len
    }

    fn end(&self) -> u64 {
        self.base.as_u64() + self.len
    }
}

/// The next address handed out when the caller does not request a fixed
/// placement. Mirrors the "mmap grows down from just below the stack"
/// convention without needing stack layout knowledge here.
const DEFAULT_MMAP_BASE: u64 = 0x0000_7000_0000_0000;

/// All mmap ranges belonging to one address space, kept sorted by base
/// address so insertion and overlap checks are a single linear scan.
pub struct MmapSpace {
    ranges: Vec<MmapRange>,
    next_hint: u64,
}

impl MmapSpace {
    /// Creates an empty mmap space.
    pub const fn new() -> Self {
        Self {
            ranges: Vec::new(),
            next_hint: DEFAULT_MMAP_BASE,
        }
    }

    fn overlaps_any(&self, base: u64, len: u64) -> bool {
        self.ranges
            .iter()
            .any(|r| base < r.end() && r.base.as_u64() < base + len)
    }

    /// Establishes a new mapping. `hint` is honored exactly when
    /// `MmapFlags::FIXED` is set; otherwise it is advisory and a free
    /// region is chosen by a simple bump allocator over the mmap area.
    pub fn mmap(
        &mut self,
        hint: VirtAddr,
        len: u64,
        prot: Prot,
        flags: MmapFlags,
        fd: Option<i32>,
        file_offset: u64,
    ) -> Result<VirtAddr, Errno> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Errno::EInval);
        }
        let base = if flags.contains(MmapFlags::FIXED) {
            let base = hint.align_down(PAGE_SIZE).as_u64();
            if self.overlaps_any(base, len) {
                return Err(Errno::EExist);
            }
            base
        } else {
            let base = self.next_hint;
            self.next_hint += len;
            debug_assert!(!self.overlaps_any(base, len), "bump allocator never reuses space");
            base
        };

        let global = Arc::new(SpinLock::new(GlobalRange {
            base: VirtAddr::new(base),
            len,
            file_offset,
            resource_fd: fd,
            shadow: BTreeMap::new(),
        }));
        let range = MmapRange {
            base: VirtAddr::new(base),
            len,
            prot,
            flags,
            file_offset,
            global,
        };
        let insert_at = self.ranges.partition_point(|r| r.base.as_u64() < base);
        self.ranges.insert(insert_at, range);
        Ok(VirtAddr::new(base))
    }

    /// Changes protection on `[addr, addr+len)`. Any local range that only
    /// partially overlaps the request is split into up to three pieces (the
    /// unaffected prefix, the re-protected middle, the unaffected suffix);
    /// a hole anywhere in `[addr, addr+len)` not covered by any range is
    /// rejected with `EInval`.
    pub fn mprotect(&mut self, addr: VirtAddr, len: u64, prot: Prot) -> Result<(), Errno> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(Errno::EInval);
        }
        let start = addr.as_u64();
        let end = start + len;

        let first = self.ranges.partition_point(|r| r.end() <= start);
        let mut idx = first;
        let mut cursor = start;
        let mut last = first;
        while idx < self.ranges.len() && self.ranges[idx].base.as_u64() < end {
            let r = &self.ranges[idx];
            if r.base.as_u64() > cursor {
                return Err(Errno::EInval);
            }
            cursor = r.end();
            last = idx;
            idx += 1;
        }
        if idx == first || cursor < end {
            return Err(Errno::EInval);
        }

        let removed: Vec<MmapRange> = self.ranges.splice(first..=last, core::iter::empty()).collect();
        let mut insert_at = first;
        for range in removed {
            for piece in split_range(range, start, end, prot) {
                self.ranges.insert(insert_at, piece);
                insert_at += 1;
            }
        }
        Ok(())
    }

    /// Removes the mapping covering `[addr, addr+len)`. Must exactly match
    /// an existing range's bounds.
    pub fn munmap(&mut self, addr: VirtAddr, len: u64) -> Result<MmapRange, Errno> {
        let target = addr.as_u64();
        let idx = self
            .ranges
            .iter()
            .position(|r| r.base.as_u64() == target && r.len == len)
            .ok_or(Errno::EInval)?;
        Ok(self.ranges.remove(idx))
    }

    /// Finds the range covering `addr`, if any — used by the page fault
    /// handler to decide how to resolve a fault.
    pub fn find(&self, addr: VirtAddr) -> Option<&MmapRange> {
        self.ranges.iter().find(|r| r.contains(addr))
    }

    /// Finds the range covering `addr`, mutably.
    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut MmapRange> {
        self.ranges.iter_mut().find(|r| r.contains(addr))
    }

    /// Builds the child's mmap space for a `fork()`.
    ///
    /// `MAP_SHARED` locals keep pointing at the parent's global range (the
    /// `Arc` is cloned, no physical copy); unfaulted pages of a shared
    /// global populate lazily per address space on that address space's own
    /// next fault. `MAP_PRIVATE` locals get a brand-new global range with a
    /// freshly allocated, eagerly copied frame for every page already
    /// present in the parent's shadow, so the child is immediately
    /// independent: a write through the child never becomes visible to the
    /// parent. Locals that share one global in the parent (because an
    /// earlier `mprotect` split it) still share one copy in the child.
    pub fn fork(&self, pmm: &Pmm, hhdm_offset: u64) -> Result<Self, Errno> {
        let mut copied: BTreeMap<usize, Arc<SpinLock<GlobalRange>>> = BTreeMap::new();
        let mut new_ranges = Vec::with_capacity(self.ranges.len());

        for range in &self.ranges {
            let new_global = if range.flags.contains(MmapFlags::SHARED) {
                Arc::clone(&range.global)
            } else {
                let key = Arc::as_ptr(&range.global) as usize;
                if let Some(existing) = copied.get(&key) {
                    Arc::clone(existing)
                } else {
                    let duplicate = duplicate_private_global(&range.global, pmm, hhdm_offset)?;
                    let arc = Arc::new(SpinLock::new(duplicate));
                    copied.insert(key, Arc::clone(&arc));
                    arc
                }
            };
            new_ranges.push(MmapRange {
                base: range.base,
                len: range.len,
                prot: range.prot,
                flags: range.flags,
                file_offset: range.file_offset,
                global: new_global,
            });
        }

        Ok(Self {
            ranges: new_ranges,
            next_hint: self.next_hint,
        })
    }

    /// Iterates all ranges, for `/proc`-style introspection or full
    /// address-space teardown.
    pub fn iter(&self) -> impl Iterator<Item = &MmapRange> {
        self.ranges.iter()
    }
}

impl Default for MmapSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `range` against `[start, end)`, returning the unaffected prefix
/// (if any), the re-protected overlap, and the unaffected suffix (if any),
/// in base-address order.
fn split_range(range: MmapRange, start: u64, end: u64, new_prot: Prot) -> Vec<MmapRange> {
    let base = range.base.as_u64();
    let range_end = range.end();
    let overlap_start = start.max(base);
    let overlap_end = end.min(range_end);

    let mut pieces = Vec::with_capacity(3);
    if base < overlap_start {
        pieces.push(MmapRange {
            base: range.base,
            len: overlap_start - base,
            prot: range.prot,
            flags: range.flags,
            file_offset: range.file_offset,
            global: Arc::clone(&range.global),
        });
    }
    pieces.push(MmapRange {
        base: VirtAddr::new(overlap_start),
        len: overlap_end - overlap_start,
        prot: new_prot,
        flags: range.flags,
        file_offset: range.file_offset + (overlap_start - base),
        global: Arc::clone(&range.global),
    });
    if overlap_end < range_end {
        pieces.push(MmapRange {
            base: VirtAddr::new(overlap_end),
            len: range_end - overlap_end,
            prot: range.prot,
            flags: range.flags,
            file_offset: range.file_offset + (overlap_end - base),
            global: range.global,
        });
    }
    pieces
}

/// Builds a fresh [`GlobalRange`] for a `MAP_PRIVATE` fork child: same
/// metadata as `parent`, but every shadow page gets its own freshly
/// allocated, byte-for-byte copied frame.
fn duplicate_private_global(
    parent: &Arc<SpinLock<GlobalRange>>,
    pmm: &Pmm,
    hhdm_offset: u64,
) -> Result<GlobalRange, Errno> {
    let parent = parent.lock();
    let mut shadow = BTreeMap::new();
    for (&page_index, &phys) in parent.shadow.iter() {
        let frame = pmm.alloc(1).ok_or(Errno::ENoMem)?;
        // SAFETY: `phys` is a live frame already mapped through the HHDM at
        // `hhdm_offset`; `frame` was just allocated and not aliased
        // elsewhere. Both accesses are page-sized and page-aligned.
        unsafe {
            let src = (hhdm_offset + phys.as_u64()) as *const u8;
            let dst = (hhdm_offset + frame.as_u64()) as *mut u8;
            core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE as usize);
        }
        shadow.insert(page_index, frame);
    }
    Ok(GlobalRange {
        base: parent.base,
        len: parent.len,
        file_offset: parent.file_offset,
        resource_fd: parent.resource_fd,
        shadow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::{BitmapAllocator, MemoryMapEntry};

    fn test_pmm(pool_bytes: u64) -> (Pmm, Vec<u8>) {
        let total = pool_bytes + 4096;
        let mut backing = vec![0u8; total as usize];
        let base = backing.as_mut_ptr() as u64;
        let map = [MemoryMapEntry {
            base,
            length: total,
            usable: true,
        }];
        let allocator = unsafe { BitmapAllocator::new(&map, 0).unwrap() };
        let pmm = Pmm::uninit();
        pmm.init(allocator);
        (pmm, backing)
    }

    #[test]
    fn mmap_bump_allocates_nonoverlapping_ranges() {
        let mut space = MmapSpace::new();
        let a = space
            .mmap(VirtAddr::zero(), 4096, Prot::READ | Prot::WRITE, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        let b = space
            .mmap(VirtAddr::zero(), 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_mapping_into_occupied_space_is_rejected() {
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(VirtAddr::zero(), 8192, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        let result = space.mmap(addr, 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::FIXED, None, 0);
        assert_eq!(result, Err(Errno::EExist));
    }

    #[test]
    fn munmap_then_find_returns_none() {
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(VirtAddr::zero(), 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        space.munmap(addr, 4096).unwrap();
        assert!(space.find(addr).is_none());
    }

    #[test]
    fn mprotect_updates_existing_range() {
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(VirtAddr::zero(), 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        space.mprotect(addr, 4096, Prot::READ | Prot::WRITE).unwrap();
        assert_eq!(space.find(addr).unwrap().prot, Prot::READ | Prot::WRITE);
    }

    #[test]
    fn mprotect_splits_partially_covered_range() {
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(VirtAddr::zero(), 3 * 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        // Re-protect only the middle page.
        space
            .mprotect(VirtAddr::new(addr.as_u64() + 4096), 4096, Prot::READ | Prot::WRITE)
            .unwrap();

        assert_eq!(space.iter().count(), 3);
        let first = space.find(addr).unwrap();
        assert_eq!(first.prot, Prot::READ);
        assert_eq!(first.len, 4096);

        let middle = space.find(VirtAddr::new(addr.as_u64() + 4096)).unwrap();
        assert_eq!(middle.prot, Prot::READ | Prot::WRITE);
        assert_eq!(middle.len, 4096);

        let last = space.find(VirtAddr::new(addr.as_u64() + 2 * 4096)).unwrap();
        assert_eq!(last.prot, Prot::READ);
        assert_eq!(last.len, 4096);
    }

    #[test]
    fn mprotect_over_a_hole_is_rejected() {
        let mut space = MmapSpace::new();
        space
            .mmap(VirtAddr::zero(), 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        // Second page was never mapped: request spans the hole.
        let result = space.mprotect(VirtAddr::zero(), 2 * 4096, Prot::READ | Prot::WRITE);
        assert_eq!(result, Err(Errno::EInval));
    }

    #[test]
    fn fork_duplicates_ranges_independently() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut space = MmapSpace::new();
        space
            .mmap(VirtAddr::zero(), 4096, Prot::READ, MmapFlags::ANONYMOUS | MmapFlags::PRIVATE, None, 0)
            .unwrap();
        let child = space.fork(&pmm, 0).unwrap();
        assert_eq!(child.iter().count(), space.iter().count());
    }

    #[test]
    fn private_anonymous_fork_copies_already_faulted_pages() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(
                VirtAddr::zero(),
                4096,
                Prot::READ | Prot::WRITE,
                MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();

        // Simulate the fault resolver having already faulted in page 0.
        let parent_frame = pmm.alloc(1).unwrap();
        unsafe {
            let ptr = parent_frame.as_u64() as *mut u64;
            *ptr = 0x1234;
        }
        {
            let local = space.find(addr).unwrap();
            local.global.lock().shadow.insert(0, parent_frame);
        }

        let child = space.fork(&pmm, 0).unwrap();
        let child_frame = *child.find(addr).unwrap().global.lock().shadow.get(&0).unwrap();
        assert_ne!(child_frame.as_u64(), parent_frame.as_u64());

        // Child writes through its own copy...
        unsafe {
            let ptr = child_frame.as_u64() as *mut u64;
            *ptr = 0x5678;
        }
        // ...parent's original frame is untouched.
        unsafe {
            let ptr = parent_frame.as_u64() as *const u64;
            assert_eq!(*ptr, 0x1234);
        }
    }

    #[test]
    fn shared_fork_keeps_same_global() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut space = MmapSpace::new();
        let addr = space
            .mmap(
                VirtAddr::zero(),
                4096,
                Prot::READ | Prot::WRITE,
                MmapFlags::ANONYMOUS | MmapFlags::SHARED,
                None,
                0,
            )
            .unwrap();
        let child = space.fork(&pmm, 0).unwrap();
        assert!(Arc::ptr_eq(
            &space.find(addr).unwrap().global,
            &child.find(addr).unwrap().global
        ));
    }
}
