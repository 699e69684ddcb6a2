//! Slab allocator for kernel heap objects.
//!
//! Ten fixed size classes from 8 to 1024 bytes each get their own run of
//! same-sized slab pages; anything larger is satisfied directly from the
//! physical allocator as a multi-page run. A page's first bytes hold a
//! [`SlabPageHeader`] recording which size class it belongs to and the head
//! of its intrusive free list, so `free` never needs the caller to repeat
//! the size it originally asked for: it inspects the page the pointer falls
//! in and, if the pointer itself is page-aligned, treats it as an oversized
//! allocation instead of a slab object (no size class ever hands out a
//! page-aligned object, since every object lives after the page header).

use kcore::sync::SpinLock;

use crate::pmm::Pmm;

const PAGE_SIZE: u64 = 4096;

/// Ascending object sizes, in bytes, for the ten slab size classes.
pub const SIZE_CLASSES: [usize; 10] = [8, 16, 24, 32, 48, 64, 128, 256, 512, 1024];

/// Largest object size served by a size class; anything bigger is an
/// oversized, page-granular allocation.
pub const MAX_SLAB_SIZE: usize = 1024;

#[repr(C)]
struct SlabPageHeader {
    class: u8,
    free_list: *mut FreeNode,
}

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

struct SizeClassState {
    /// Pages currently holding at least one free object.
    partial: *mut SlabPageHeader,
}

// SAFETY: all access goes through `SlabAllocator`'s spinlock.
unsafe impl Send for SizeClassState {}

/// A slab-backed heap allocator.
pub struct SlabAllocator<'a> {
    classes: SpinLock<[SizeClassState; SIZE_CLASSES.len()]>,
    pmm: &'a Pmm,
    hhdm_offset: u64,
}

impl<'a> SlabAllocator<'a> {
    /// Creates an empty allocator. `hhdm_offset` lets freshly allocated
    /// physical frames be addressed directly as kernel heap memory, the
    /// same identity-mapped-by-offset scheme the PMM uses for its own
    /// bitmap.
    pub fn new(pmm: &'a Pmm, hhdm_offset: u64) -> Self {
        Self {
            classes: SpinLock::new(core::array::from_fn(|_| SizeClassState {
                partial: core::ptr::null_mut(),
            })),
            pmm,
            hhdm_offset,
        }
    }

    fn class_for(size: usize) -> Option<usize> {
        SIZE_CLASSES.iter().position(|&c| c >= size)
    }

    /// Allocates an object of at least `size` bytes. `size == 0` yields a
    /// non-null unique dangling-style pointer from the smallest size class.
    pub fn alloc(&self, size: usize) -> Option<*mut u8> {
        if size > MAX_SLAB_SIZE {
            return self.alloc_oversized(size);
        }
        let class_idx = Self::class_for(size.max(1))?;
        let mut classes = self.classes.lock();
        let state = &mut classes[class_idx];

        if state.partial.is_null() {
            let page = self.new_slab_page(class_idx)?;
            state.partial = page;
        }

        // SAFETY: `partial` is either null (handled above) or a page header
        // we wrote ourselves with `new_slab_page`.
        let header = unsafe { &mut *state.partial };
        let node = header.free_list;
        debug_assert!(!node.is_null(), "partial page must have a free object");
        // SAFETY: `node` was linked by `new_slab_page` or a prior `free`.
        header.free_list = unsafe { (*node).next };
        if header.free_list.is_null() {
            state.partial = core::ptr::null_mut();
        }
        Some(node as *mut u8)
    }

    fn new_slab_page(&self, class_idx: usize) -> Option<*mut SlabPageHeader> {
        // SAFETY: `hhdm_offset` was supplied by the caller of `new` and is
        // the real HHDM offset.
        let phys = unsafe { self.pmm.alloc_zeroed(1, self.hhdm_offset)? };
        let page = (self.hhdm_offset + phys.as_u64()) as *mut u8;
        let object_size = SIZE_CLASSES[class_idx];
        let header_size = core::mem::size_of::<SlabPageHeader>();
        let usable = (PAGE_SIZE as usize) - header_size;
        let count = usable / object_size;

        let header = page as *mut SlabPageHeader;
        let mut free_list: *mut FreeNode = core::ptr::null_mut();
        for i in (0..count).rev() {
            // SAFETY: offsets stay within the page allocated above.
            let obj = unsafe { page.add(header_size + i * object_size) } as *mut FreeNode;
            unsafe {
                (*obj).next = free_list;
            }
            free_list = obj;
        }
        // SAFETY: `header` points at the start of the page we just zeroed.
        unsafe {
            (*header).class = class_idx as u8;
            (*header).free_list = free_list;
        }
        Some(header)
    }

    fn alloc_oversized(&self, size: usize) -> Option<*mut u8> {
        let pages = (size as u64).div_ceil(PAGE_SIZE) as usize;
        // SAFETY: see `new_slab_page`.
        let phys = unsafe { self.pmm.alloc_zeroed(pages, self.hhdm_offset)? };
        Some((self.hhdm_offset + phys.as_u64()) as *mut u8)
    }

    /// Frees a pointer previously returned by [`SlabAllocator::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this allocator and not been freed already.
    pub unsafe fn free(&self, ptr: *mut u8, size_hint: usize) {
        let addr = ptr as u64;
        if addr % PAGE_SIZE == 0 {
            // A page-aligned pointer is always an oversized allocation: no
            // size class ever places an object at its page's first byte,
            // since the header occupies it.
            let pages = (size_hint as u64).div_ceil(PAGE_SIZE).max(1) as usize;
            let phys_base = addr - self.hhdm_offset;
            self.pmm.free(kcore::addr::PhysAddr::new(phys_base), pages);
            return;
        }

        let page_base = addr & !(PAGE_SIZE - 1);
        // SAFETY: `page_base` is the start of the slab page `ptr` was handed
        // out from, which always begins with a `SlabPageHeader`.
        let header = unsafe { &mut *(page_base as *mut SlabPageHeader) };
        let node = ptr as *mut FreeNode;
        // SAFETY: `node` lies within the page whose header we just derefed.
        unsafe {
            (*node).next = header.free_list;
        }
        header.free_list = node;

        let mut classes = self.classes.lock();
        let state = &mut classes[header.class as usize];
        if state.partial.is_null() {
            state.partial = header as *mut SlabPageHeader;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmm::{BitmapAllocator, MemoryMapEntry};

    fn test_pmm(pages: u64) -> (Pmm, Vec<u8>) {
        let total = (pages + 1) * PAGE_SIZE;
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
    fn small_alloc_picks_smallest_fitting_class() {
        assert_eq!(SlabAllocator::class_for(1), Some(0));
        assert_eq!(SlabAllocator::class_for(8), Some(0));
        assert_eq!(SlabAllocator::class_for(9), Some(1));
        assert_eq!(SlabAllocator::class_for(1024), Some(9));
        assert_eq!(SlabAllocator::class_for(1025), None);
    }

    #[test]
    fn alloc_and_free_small_object_roundtrips() {
        let (pmm, _backing) = test_pmm(4);
        let slab = SlabAllocator::new(&pmm, 0);
        let ptr = slab.alloc(32).expect("alloc should succeed");
        assert_ne!(ptr as u64 % PAGE_SIZE, 0, "slab objects are never page-aligned");
        unsafe { slab.free(ptr, 32) };
    }

    #[test]
    fn oversized_alloc_is_page_aligned() {
        let (pmm, _backing) = test_pmm(8);
        let slab = SlabAllocator::new(&pmm, 0);
        let ptr = slab.alloc(4096 * 2).expect("alloc should succeed");
        assert_eq!(ptr as u64 % PAGE_SIZE, 0);
        unsafe { slab.free(ptr, 4096 * 2) };
    }

    #[test]
    fn reused_freed_slot_is_handed_back_out() {
        let (pmm, _backing) = test_pmm(4);
        let slab = SlabAllocator::new(&pmm, 0);
        let a = slab.alloc(16).unwrap();
        unsafe { slab.free(a, 16) };
        let b = slab.alloc(16).unwrap();
        assert_eq!(a, b);
    }
}
