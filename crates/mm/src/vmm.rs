//! Virtual memory manager: 4-level page table walk and address space
//! construction.

use kcore::addr::{PhysAddr, VirtAddr};
use kcore::paging::{PageTable, PageTableEntry, PageTableFlags};

use crate::mapper::{MapFlags, MapFlush, UnmapError};
use crate::pmm::Pmm;

/// Error returned by [`AddressSpace::map`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// No physical frame was available to allocate an intermediate page
    /// table.
    OutOfMemory,
}

fn map_flags_to_pte(flags: MapFlags) -> PageTableFlags {
    let mut pte = PageTableFlags::PRESENT;
    if flags.contains(MapFlags::WRITABLE) {
        pte |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MapFlags::USER) {
        pte |= PageTableFlags::USER;
    }
    if flags.contains(MapFlags::GLOBAL) {
        pte |= PageTableFlags::GLOBAL;
    }
    if flags.contains(MapFlags::CACHE_DISABLE) {
        pte |= PageTableFlags::CACHE_DISABLE;
    }
    if !flags.contains(MapFlags::EXECUTABLE) {
        pte |= PageTableFlags::NO_EXECUTE;
    }
    pte
}

/// First PML4 index of the shared upper half (256..511), aliased by value
/// into every address space so kernel mappings stay visible after a CR3
/// switch.
const KERNEL_PML4_ENTRIES: usize = 256;

/// A single page-table-backed address space (one PML4 tree).
///
/// `hhdm_offset` lets the walker dereference physical table frames by
/// adding the direct-map offset; every intermediate table is allocated
/// zeroed from `pmm` on demand.
pub struct AddressSpace<'a> {
    root: PhysAddr,
    hhdm_offset: u64,
    pmm: &'a Pmm,
}

impl<'a> AddressSpace<'a> {
    /// Wraps an existing PML4 root (e.g. the bootloader's page tables, or
    /// one created by [`AddressSpace::new`]).
    pub fn from_root(root: PhysAddr, hhdm_offset: u64, pmm: &'a Pmm) -> Self {
        Self {
            root,
            hhdm_offset,
            pmm,
        }
    }

    /// Allocates a fresh PML4 for a new user address space, with its upper
    /// half (entries 256..511) aliased by value from `kernel_root` so kernel
    /// mappings are visible regardless of which address space is loaded.
    /// The lower half starts empty.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must be the real HHDM offset, and `kernel_root` must
    /// name a valid PML4 whose upper half is the kernel's own mapping.
    pub unsafe fn new(hhdm_offset: u64, pmm: &'a Pmm, kernel_root: PhysAddr) -> Option<Self> {
        // SAFETY: `hhdm_offset` is caller-certified; the frame was just
        // allocated and is not aliased elsewhere.
        let root = unsafe { pmm.alloc_zeroed(1, hhdm_offset)? };
        let space = Self {
            root,
            hhdm_offset,
            pmm,
        };
        let new_table = space.table(root);
        let kernel_table = space.table(kernel_root);
        // SAFETY: both tables are reached through their HHDM aliases, which
        // are mapped for the lifetime of both address spaces; entries are
        // `Copy`, so this is a plain value copy of the upper half.
        new_table.entries[KERNEL_PML4_ENTRIES..]
            .copy_from_slice(&kernel_table.entries[KERNEL_PML4_ENTRIES..]);
        Some(space)
    }

    /// Returns the physical address of the PML4 root, for loading into CR3.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    fn table_ptr(&self, phys: PhysAddr) -> *mut PageTable {
        (self.hhdm_offset + phys.as_u64()) as *mut PageTable
    }

    fn table<'t>(&self, phys: PhysAddr) -> &'t mut PageTable {
        // SAFETY: `phys` always names a frame we allocated as a page table
        // and the HHDM alias for it is always mapped.
        unsafe { &mut *self.table_ptr(phys) }
    }

    /// Walks (allocating missing levels) down to the leaf PT entry for
    /// `virt`, returning `None` only on allocator exhaustion.
    fn walk_alloc(&mut self, virt: VirtAddr) -> Option<&'a mut PageTableEntry> {
        let mut table = self.table(self.root);
        for index in [virt.pml4_index(), virt.pdpt_index(), virt.pd_index()] {
            let entry = &mut table.entries[index];
            if !entry.is_present() {
                // SAFETY: `hhdm_offset` was certified at construction time.
                let frame = unsafe { self.pmm.alloc_zeroed(1, self.hhdm_offset)? };
                *entry = PageTableEntry::new(
                    frame,
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER,
                );
            }
            table = self.table(entry.address());
        }
        let pt_index = virt.pt_index();
        // SAFETY: `table` outlives `self` because it is reached through the
        // HHDM alias, which is mapped for the process lifetime.
        Some(unsafe { &mut *(&mut table.entries[pt_index] as *mut PageTableEntry) })
    }

    /// Walks down to the leaf PT entry for `virt` without allocating,
    /// returning `None` if any level is absent.
    fn walk(&self, virt: VirtAddr) -> Option<&PageTableEntry> {
        let mut table: &PageTable = self.table(self.root);
        for index in [virt.pml4_index(), virt.pdpt_index(), virt.pd_index()] {
            let entry = &table.entries[index];
            if !entry.is_present() {
                return None;
            }
            table = self.table(entry.address());
        }
        Some(&table.entries[virt.pt_index()])
    }

    /// Maps `virt` to `phys` with the given permissions.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: MapFlags,
    ) -> Result<MapFlush, VmmError> {
        let entry = self.walk_alloc(virt).ok_or(VmmError::OutOfMemory)?;
        if entry.is_present() {
            return Err(VmmError::AlreadyMapped);
        }
        *entry = PageTableEntry::new(phys, map_flags_to_pte(flags));
        Ok(MapFlush::new(virt))
    }

    /// Updates the permission flags of an already-mapped page, keeping its
    /// physical address.
    pub fn update_flags(&mut self, virt: VirtAddr, flags: MapFlags) -> Result<MapFlush, UnmapError> {
        let entry = self.walk_alloc(virt).ok_or(UnmapError::NotMapped)?;
        if !entry.is_present() {
            return Err(UnmapError::NotMapped);
        }
        entry.set_flags(map_flags_to_pte(flags));
        Ok(MapFlush::new(virt))
    }

    /// Unmaps `virt`, returning the physical frame it pointed to.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<(PhysAddr, MapFlush), UnmapError> {
        match self.walk(virt) {
            Some(entry) if entry.is_present() => {
                let phys = entry.address();
                // Re-walk mutably: `walk` only proves presence.
                let entry = self.walk_alloc(virt).expect("just observed present");
                entry.clear();
                Ok((phys, MapFlush::new(virt)))
            }
            _ => Err(UnmapError::NotMapped),
        }
    }

    /// Translates a virtual address to its mapped physical address, if any.
    pub fn translate_addr(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let entry = self.walk(virt)?;
        if !entry.is_present() {
            return None;
        }
        Some(PhysAddr::new(entry.address().as_u64() + virt.page_offset()))
    }
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

    /// A throwaway "kernel" PML4 frame for tests that don't care about its
    /// contents, only that [`AddressSpace::new`] copies from it.
    fn fake_kernel_root(pmm: &Pmm) -> PhysAddr {
        unsafe { pmm.alloc_zeroed(1, 0).unwrap() }
    }

    #[test]
    fn map_then_translate_roundtrips() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let kernel_root = fake_kernel_root(&pmm);
        let mut space = unsafe { AddressSpace::new(0, &pmm, kernel_root).unwrap() };
        let virt = VirtAddr::new(0x0000_1000_0000_0000);
        let phys = pmm.alloc(1).unwrap();
        space.map(virt, phys, MapFlags::WRITABLE).unwrap().ignore();
        assert_eq!(space.translate_addr(virt), Some(phys));
    }

    #[test]
    fn double_map_is_rejected() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let kernel_root = fake_kernel_root(&pmm);
        let mut space = unsafe { AddressSpace::new(0, &pmm, kernel_root).unwrap() };
        let virt = VirtAddr::new(0x0000_2000_0000_0000);
        let phys = pmm.alloc(1).unwrap();
        space.map(virt, phys, MapFlags::WRITABLE).unwrap().ignore();
        assert_eq!(
            space.map(virt, phys, MapFlags::WRITABLE).unwrap_err(),
            VmmError::AlreadyMapped
        );
    }

    #[test]
    fn unmap_clears_translation() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let kernel_root = fake_kernel_root(&pmm);
        let mut space = unsafe { AddressSpace::new(0, &pmm, kernel_root).unwrap() };
        let virt = VirtAddr::new(0x0000_3000_0000_0000);
        let phys = pmm.alloc(1).unwrap();
        space.map(virt, phys, MapFlags::WRITABLE).unwrap().ignore();
        let (unmapped_phys, flush) = space.unmap(virt).unwrap();
        flush.ignore();
        assert_eq!(unmapped_phys, phys);
        assert_eq!(space.translate_addr(virt), None);
    }

    #[test]
    fn unmap_unmapped_is_error() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let kernel_root = fake_kernel_root(&pmm);
        let space = unsafe { AddressSpace::new(0, &pmm, kernel_root).unwrap() };
        let virt = VirtAddr::new(0x0000_4000_0000_0000);
        let mut space = space;
        assert_eq!(space.unmap(virt).unwrap_err(), UnmapError::NotMapped);
    }

    #[test]
    fn new_address_space_aliases_kernel_upper_half() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let kernel_root = fake_kernel_root(&pmm);
        // Plant a recognizable entry at PML4 index 300, well into the
        // shared upper half, directly in the "kernel" table.
        let kernel_virt = VirtAddr::new(0x0000_0000_0000_0000 | (300u64 << 39));
        let mut kernel_space = AddressSpace::from_root(kernel_root, 0, &pmm);
        let kernel_phys = pmm.alloc(1).unwrap();
        kernel_space
            .map(kernel_virt, kernel_phys, MapFlags::WRITABLE)
            .unwrap()
            .ignore();

        let space = unsafe { AddressSpace::new(0, &pmm, kernel_root).unwrap() };
        assert_eq!(space.translate_addr(kernel_virt), Some(kernel_phys));
    }
}
