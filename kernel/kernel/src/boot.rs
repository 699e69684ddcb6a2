//! Bootloader-agnostic boot information.
//!
//! [`BootInfo`] is the trait boundary between this crate and whatever
//! bootloader stub hands off control (Limine, an EFI stub, ...): that stub
//! owns parsing the bootloader's native request/response structures and
//! converting them into the canonical types below before calling
//! [`kernel_init`]. No concrete Limine response parsing lives here.

use alloc::vec::Vec;

use kcore::addr::{PhysAddr, VirtAddr};
use kfs::Vfs;
use kmm::{BitmapAllocator, Pmm};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables that can be reclaimed after parsing.
    AcpiReclaimable,
    /// Memory used by the bootloader, reclaimable after boot.
    BootloaderReclaimable,
    /// Memory occupied by the kernel image and loaded modules.
    KernelAndModules,
    /// Memory-mapped framebuffer region.
    Framebuffer,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Kind of memory region.
    pub kind: MemoryRegionKind,
}

/// Physical and virtual base addresses of the loaded kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddressInfo {
    /// Physical base address of the kernel.
    pub physical_base: PhysAddr,
    /// Virtual base address of the kernel.
    pub virtual_base: VirtAddr,
}

/// Pixel format of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit RGB.
    Rgb32,
    /// 32-bit BGR.
    Bgr32,
}

/// A linear framebuffer handed off by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the framebuffer (HHDM-mapped).
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u8,
    /// Pixel format.
    pub pixel_format: PixelFormat,
}

/// A boot module (e.g. an initrd) loaded alongside the kernel.
#[derive(Debug, Clone, Copy)]
pub struct ModuleInfo {
    /// Physical address of the module's bytes.
    pub phys_addr: PhysAddr,
    /// Size in bytes.
    pub size: u64,
}

/// Everything the kernel needs from whichever bootloader handed off
/// control, abstracted behind a trait so no concrete bootloader protocol
/// is named here.
pub trait BootInfo {
    /// Physical memory map, sorted by start address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virtual = physical + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Kernel load addresses (physical and virtual base).
    fn kernel_address(&self) -> KernelAddressInfo;

    /// ACPI RSDP physical address.
    fn rsdp_address(&self) -> PhysAddr;

    /// Framebuffers reported by the bootloader, if any.
    fn framebuffers(&self) -> &[FramebufferInfo];

    /// Modules loaded alongside the kernel image.
    fn modules(&self) -> &[ModuleInfo];

    /// Boot wall-clock time, Unix seconds, if the bootloader reported one.
    fn boot_time_unix(&self) -> Option<u64>;
}

/// Builds the physical-frame allocator from `info`'s memory map.
///
/// # Safety
///
/// Must be called exactly once during boot, before any other CPU touches
/// physical memory, with the real HHDM offset reported by the bootloader.
#[must_use]
pub unsafe fn build_pmm(info: &impl BootInfo) -> Pmm {
    let entries: Vec<kmm::MemoryMapEntry> = info
        .memory_map()
        .iter()
        .map(|region| kmm::MemoryMapEntry {
            base: region.start.as_u64(),
            length: region.size,
            usable: region.kind == MemoryRegionKind::Usable,
        })
        .collect();

    // SAFETY: caller certifies the HHDM offset and boot-time exclusivity.
    let allocator = unsafe { BitmapAllocator::new(&entries, info.hhdm_offset()) }
        .expect("no usable memory reported by bootloader");
    let pmm = Pmm::uninit();
    pmm.init(allocator);
    pmm
}

/// Performs the boot-time sequencing this kernel needs before scheduling
/// starts: builds the PMM from the handed-off memory map and mounts the
/// root VFS.
///
/// Networking adapters, PCI enumeration, and NVMe attach happen later,
/// once interrupts and the scheduler are up; this function only covers the
/// parts that have no further external dependency.
pub fn kernel_init(info: &impl BootInfo) -> (Pmm, Vfs) {
    kcore::kinfo!("hhdm_offset={:#x}", info.hhdm_offset());
    let kaddr = info.kernel_address();
    kcore::kinfo!(
        "kernel phys={:#x} virt={:#x}",
        kaddr.physical_base.as_u64(),
        kaddr.virtual_base.as_u64()
    );
    kcore::kinfo!("rsdp={:#x}", info.rsdp_address().as_u64());
    for module in info.modules() {
        kcore::kdebug!("module at {:#x} ({} bytes)", module.phys_addr.as_u64(), module.size);
    }
    if let Some(t) = info.boot_time_unix() {
        kcore::kinfo!("boot timestamp: {} (unix)", t);
    }

    // SAFETY: called once, at boot, before any other CPU is started.
    let pmm = unsafe { build_pmm(info) };
    let vfs = crate::fsinit::mount_root();
    (pmm, vfs)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeBootInfo {
        map: Vec<MemoryRegion>,
        // Kept alive for the heap buffer the map's addresses point into.
        _backing: std::vec::Vec<u8>,
    }

    impl BootInfo for FakeBootInfo {
        fn memory_map(&self) -> &[MemoryRegion] {
            &self.map
        }
        fn hhdm_offset(&self) -> u64 {
            // Maps physical == virtual directly onto the heap buffer below.
            0
        }
        fn kernel_address(&self) -> KernelAddressInfo {
            KernelAddressInfo {
                physical_base: PhysAddr::new(0x10_0000),
                virtual_base: VirtAddr::new(0xffff_ffff_8000_0000),
            }
        }
        fn rsdp_address(&self) -> PhysAddr {
            PhysAddr::new(0xe_0000)
        }
        fn framebuffers(&self) -> &[FramebufferInfo] {
            &[]
        }
        fn modules(&self) -> &[ModuleInfo] {
            &[]
        }
        fn boot_time_unix(&self) -> Option<u64> {
            None
        }
    }

    #[test]
    fn build_pmm_skips_non_usable_regions() {
        let total_bytes = 32 * 4096u64;
        let mut backing = std::vec![0u8; total_bytes as usize];
        let base = backing.as_mut_ptr() as u64;
        let info = FakeBootInfo {
            map: alloc::vec![MemoryRegion {
                start: PhysAddr::new(base),
                size: total_bytes,
                kind: MemoryRegionKind::Usable,
            }],
            _backing: backing,
        };
        // SAFETY: test-only construction over a heap-backed fake map with
        // `hhdm_offset = 0`, exclusively owned by this test.
        let pmm = unsafe { build_pmm(&info) };
        assert!(pmm.stats().usable > 0);
    }
}
