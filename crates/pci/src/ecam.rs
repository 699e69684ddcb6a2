//! PCI Express Enhanced Configuration Access Mechanism: memory-mapped
//! access to the full 4 KiB configuration space of every bus/device/
//! function, replacing the legacy 256-byte CAM I/O port mechanism.

use core::sync::atomic::{AtomicU64, Ordering};

use kcore::addr::VirtAddr;

/// The ECAM window: `phys_base` covers `[start_bus, end_bus]`, discovered
/// from the ACPI MCFG table by the `kernel` glue crate and installed once
/// via [`set_ecam_region`].
#[derive(Debug, Clone, Copy)]
pub struct EcamRegion {
    /// Physical base address of bus `start_bus`'s configuration space.
    pub phys_base: u64,
    /// First bus number this window covers.
    pub start_bus: u8,
    /// Last bus number this window covers.
    pub end_bus: u8,
    /// HHDM offset used to address the window.
    pub hhdm_offset: u64,
}

// Packed as (phys_base, hhdm_offset, bus_range) across two atomics to avoid
// requiring a lock for a value set once at boot and read on every access.
static ECAM_BASE: AtomicU64 = AtomicU64::new(u64::MAX);
static ECAM_HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static ECAM_BUS_RANGE: AtomicU64 = AtomicU64::new(0);

/// Installs the ECAM window. Must be called once during boot before any
/// config-space access.
pub fn set_ecam_region(region: EcamRegion) {
    ECAM_BASE.store(region.phys_base, Ordering::Release);
    ECAM_HHDM_OFFSET.store(region.hhdm_offset, Ordering::Release);
    ECAM_BUS_RANGE.store(
        (region.start_bus as u64) << 8 | region.end_bus as u64,
        Ordering::Release,
    );
}

fn ecam_address(bus: u8, device: u8, function: u8, offset: u16) -> Option<VirtAddr> {
    let base = ECAM_BASE.load(Ordering::Acquire);
    if base == u64::MAX {
        return None;
    }
    let range = ECAM_BUS_RANGE.load(Ordering::Acquire);
    let start_bus = (range >> 8) as u8;
    let end_bus = range as u8;
    if bus < start_bus || bus > end_bus {
        return None;
    }
    let phys = base
        + ((bus as u64) << 20)
        + ((device as u64) << 15)
        + ((function as u64) << 12)
        + (offset as u64 & 0xFFF);
    let hhdm_offset = ECAM_HHDM_OFFSET.load(Ordering::Acquire);
    Some(VirtAddr::new(hhdm_offset + phys))
}

/// Reads a 32-bit register at `offset` (must be 4-byte aligned) from the
/// given function's configuration space.
pub fn read_u32(bus: u8, device: u8, function: u8, offset: u16) -> Option<u32> {
    let addr = ecam_address(bus, device, function, offset & !0b11)?;
    // SAFETY: `addr` lies in the HHDM-mapped ECAM window installed by
    // `set_ecam_region`, whose whole range the ACPI MCFG table guarantees
    // is backed by real configuration-space memory.
    Some(unsafe { addr.as_ptr::<u32>().read_volatile() })
}

/// Reads a 16-bit register.
pub fn read_u16(bus: u8, device: u8, function: u8, offset: u16) -> Option<u16> {
    let word = read_u32(bus, device, function, offset)?;
    Some(if offset & 0b10 != 0 {
        (word >> 16) as u16
    } else {
        word as u16
    })
}

/// Reads an 8-bit register.
pub fn read_u8(bus: u8, device: u8, function: u8, offset: u16) -> Option<u8> {
    let word = read_u32(bus, device, function, offset)?;
    Some((word >> ((offset & 0b11) * 8)) as u8)
}

/// Writes a 32-bit register.
pub fn write_u32(bus: u8, device: u8, function: u8, offset: u16, value: u32) -> bool {
    let Some(addr) = ecam_address(bus, device, function, offset & !0b11) else {
        return false;
    };
    // SAFETY: see `read_u32`.
    unsafe { (addr.as_ptr::<u32>() as *mut u32).write_volatile(value) };
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_none_before_region_installed() {
        // This process-wide static may have been set by another test; we
        // only assert the out-of-range case, which always returns `None`.
        set_ecam_region(EcamRegion {
            phys_base: 0x1000_0000,
            start_bus: 0,
            end_bus: 0,
            hhdm_offset: 0,
        });
        assert!(ecam_address(5, 0, 0, 0).is_none());
    }

    #[test]
    fn address_within_range_is_some() {
        set_ecam_region(EcamRegion {
            phys_base: 0x1000_0000,
            start_bus: 0,
            end_bus: 255,
            hhdm_offset: 0,
        });
        assert!(ecam_address(1, 2, 3, 0x10).is_some());
    }
}
