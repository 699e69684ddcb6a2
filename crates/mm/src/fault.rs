//! Page-fault resolution: the demand-paging path driven by the mmap range
//! set rather than a walk of the page tables.
//!
//! On a fault, the caller (the glue crate's trap handler) looks up the
//! faulting local range, computes which page of the mapping it names, and
//! hands both to [`resolve_fault`]. This module never knows how to read a
//! file itself — that crosses a dependency boundary `crates/mm` does not
//! have (it cannot see `crates/fs`'s `Resource` type) — so file-backed
//! pages are obtained through the caller-supplied [`PageSource`].

use kcore::addr::{PhysAddr, VirtAddr};
use kcore::errno::Errno;

use crate::mapper::{MapFlags, UnmapError};
use crate::mmap::{MmapSpace, Prot};
use crate::pmm::Pmm;
use crate::vmm::{AddressSpace, VmmError};

/// Bridges a file descriptor to a physical page, without `crates/mm`
/// depending on whatever crate owns file descriptors.
///
/// The glue crate (which depends on both `kmm` and `kfs`) implements this
/// over its fd table and `kfs::Resource::mmap`.
pub trait PageSource {
    /// Returns the physical frame backing page `file_page` (a page index,
    /// not a byte offset) of the resource named by `fd`, allocating and
    /// populating it if this is the first reference.
    fn page_in(&self, fd: i32, file_page: u64) -> Result<PhysAddr, Errno>;
}

/// Why a fault could not be resolved into a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No range in the address space's mmap space covers the faulting
    /// address at all: a genuine segmentation violation.
    NotMapped,
    /// The address is mapped, but the access kind (e.g. a write) is not
    /// permitted by the range's current protection.
    ProtectionViolation,
    /// The underlying page source or allocator failed.
    Resolve(Errno),
}

impl From<Errno> for FaultError {
    fn from(e: Errno) -> Self {
        FaultError::Resolve(e)
    }
}

/// Resolves a page fault at `addr` for `write` access.
///
/// Per the mmap range model: consult the range set for the faulting
/// address; if none covers it, the fault is a fatal "not mapped" report.
/// Otherwise compute the range-relative page index, check it against the
/// range's protection, and obtain a physical page — zeroed and freshly
/// allocated for a first-touch anonymous page, or via `source.page_in` for
/// a file-backed one — then install it in both the global range's shadow
/// (so later faults on the same mapping, in this or another address space,
/// find it already present) and this address space's own page tables.
pub fn resolve_fault(
    space: &mut AddressSpace<'_>,
    mmap_space: &MmapSpace,
    addr: VirtAddr,
    write: bool,
    pmm: &Pmm,
    hhdm_offset: u64,
    source: &dyn PageSource,
) -> Result<(), FaultError> {
    let range = mmap_space.find(addr).ok_or(FaultError::NotMapped)?;
    if write && !range.prot.contains(Prot::WRITE) {
        return Err(FaultError::ProtectionViolation);
    }
    if !write && !range.prot.contains(Prot::READ) {
        return Err(FaultError::ProtectionViolation);
    }

    let page_addr = addr.align_down(4096);
    let mut global = range.global.lock();
    // Keyed from the *global's* base, not the local's: a local range may sit
    // mid-global after an `mprotect` split, but the shadow's keys stay
    // anchored to the original global mapping so every local agrees on them.
    let memory_page = (page_addr.as_u64() - global.base.as_u64()) / 4096;

    if let Some(&phys) = global.shadow.get(&memory_page) {
        map_into_space(space, page_addr, phys, range.prot)?;
        return Ok(());
    }

    let phys = match global.resource_fd {
        Some(fd) => {
            let file_page = global.file_offset / 4096 + memory_page;
            source.page_in(fd, file_page)?
        }
        None => {
            // SAFETY: `hhdm_offset` is the real HHDM offset maintained by the
            // whole crate's contract; the frame was just allocated.
            unsafe { pmm.alloc_zeroed(1, hhdm_offset) }.ok_or(Errno::ENoMem)?
        }
    };

    global.shadow.insert(memory_page, phys);
    map_into_space(space, page_addr, phys, range.prot)?;
    Ok(())
}

fn prot_to_map_flags(prot: Prot) -> MapFlags {
    let mut flags = MapFlags::USER;
    if prot.contains(Prot::WRITE) {
        flags |= MapFlags::WRITABLE;
    }
    if prot.contains(Prot::EXEC) {
        flags |= MapFlags::EXECUTABLE;
    }
    flags
}

fn map_into_space(
    space: &mut AddressSpace<'_>,
    page_addr: VirtAddr,
    phys: PhysAddr,
    prot: Prot,
) -> Result<(), FaultError> {
    let flags = prot_to_map_flags(prot);
    match space.map(page_addr, phys, flags) {
        Ok(flush) => {
            flush.flush();
            Ok(())
        }
        Err(VmmError::AlreadyMapped) => {
            // Already present from a previous fault on this exact address
            // (e.g. a racing read then write): just refresh permissions.
            match space.update_flags(page_addr, flags) {
                Ok(flush) => {
                    flush.flush();
                    Ok(())
                }
                Err(UnmapError::NotMapped) => unreachable!("map just reported AlreadyMapped"),
            }
        }
        Err(VmmError::OutOfMemory) => Err(FaultError::Resolve(Errno::ENoMem)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::MmapFlags;
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

    struct NoFiles;
    impl PageSource for NoFiles {
        fn page_in(&self, _fd: i32, _file_page: u64) -> Result<PhysAddr, Errno> {
            Err(Errno::EBadf)
        }
    }

    struct FixedPage(PhysAddr);
    impl PageSource for FixedPage {
        fn page_in(&self, _fd: i32, _file_page: u64) -> Result<PhysAddr, Errno> {
            Ok(self.0)
        }
    }

    #[test]
    fn anon_first_touch_fault_allocates_and_maps() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut mmap_space = MmapSpace::new();
        let addr = mmap_space
            .mmap(
                VirtAddr::zero(),
                4096,
                Prot::READ | Prot::WRITE,
                MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();
        let root = pmm.alloc(1).unwrap();
        let mut space = AddressSpace::from_root(root, 0, &pmm);

        resolve_fault(&mut space, &mmap_space, addr, true, &pmm, 0, &NoFiles).unwrap();

        assert!(space.translate_addr(addr).is_some());
        let local = mmap_space.find(addr).unwrap();
        assert_eq!(local.global.lock().shadow.len(), 1);
    }

    #[test]
    fn write_fault_without_write_prot_is_protection_violation() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut mmap_space = MmapSpace::new();
        let addr = mmap_space
            .mmap(
                VirtAddr::zero(),
                4096,
                Prot::READ,
                MmapFlags::ANONYMOUS | MmapFlags::PRIVATE,
                None,
                0,
            )
            .unwrap();
        let root = pmm.alloc(1).unwrap();
        let mut space = AddressSpace::from_root(root, 0, &pmm);

        let err = resolve_fault(&mut space, &mmap_space, addr, true, &pmm, 0, &NoFiles).unwrap_err();
        assert_eq!(err, FaultError::ProtectionViolation);
    }

    #[test]
    fn fault_on_unmapped_address_is_not_mapped() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mmap_space = MmapSpace::new();
        let root = pmm.alloc(1).unwrap();
        let mut space = AddressSpace::from_root(root, 0, &pmm);

        let err = resolve_fault(&mut space, &mmap_space, VirtAddr::zero(), false, &pmm, 0, &NoFiles)
            .unwrap_err();
        assert_eq!(err, FaultError::NotMapped);
    }

    #[test]
    fn file_backed_fault_pages_in_through_source() {
        let (pmm, _backing) = test_pmm(64 * 4096);
        let mut mmap_space = MmapSpace::new();
        let addr = mmap_space
            .mmap(
                VirtAddr::zero(),
                4096,
                Prot::READ,
                MmapFlags::PRIVATE,
                Some(3),
                0,
            )
            .unwrap();
        let root = pmm.alloc(1).unwrap();
        let mut space = AddressSpace::from_root(root, 0, &pmm);
        let file_frame = pmm.alloc(1).unwrap();

        resolve_fault(&mut space, &mmap_space, addr, false, &pmm, 0, &FixedPage(file_frame)).unwrap();

        assert_eq!(space.translate_addr(addr), Some(file_frame));
    }
}
