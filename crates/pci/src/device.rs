//! PCI device identity, matching, and decoded Base Address Registers.

bitflags::bitflags! {
    /// Bits of the command register relevant to bringing up a device found
    /// during enumeration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        /// Respond to memory space accesses.
        const MEMORY_SPACE  = 1 << 1;
        /// Respond to I/O space accesses.
        const IO_SPACE      = 1 << 0;
        /// Act as a PCI bus master (required for DMA, e.g. NVMe queues).
        const BUS_MASTER    = 1 << 2;
    }
}

/// PCI bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    /// Bus number.
    pub bus: u8,
    /// Device (slot) number, 0-31.
    pub device: u8,
    /// Function number, 0-7.
    pub function: u8,
}

impl core::fmt::Display for PciAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Wildcard value matching any vendor/device ID in a [`PciDeviceId`].
pub const PCI_ANY_ID: u16 = 0xFFFF;

/// A driver's description of the device(s) it attaches to, matched either
/// by exact vendor/device ID or by class/subclass/prog-if.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceId {
    /// Vendor ID, or [`PCI_ANY_ID`] to ignore.
    pub vendor: u16,
    /// Device ID, or [`PCI_ANY_ID`] to ignore.
    pub device: u16,
    /// Class code: `(class << 16) | (subclass << 8) | prog_if`.
    pub class: u32,
    /// Mask applied to `class` before comparison; 0 disables class matching.
    pub class_mask: u32,
}

impl PciDeviceId {
    /// Matches an exact vendor/device pair, ignoring class.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor,
            device,
            class: 0,
            class_mask: 0,
        }
    }

    /// Matches any device of the given class/subclass/prog-if, ignoring
    /// vendor/device. This is how the NVMe attach trigger
    /// (class 0x01, subclass 0x08, prog-if 0x02) is expressed.
    #[must_use]
    pub const fn with_class_progif(class: u8, subclass: u8, prog_if: u8) -> Self {
        Self {
            vendor: PCI_ANY_ID,
            device: PCI_ANY_ID,
            class: ((class as u32) << 16) | ((subclass as u32) << 8) | (prog_if as u32),
            class_mask: 0xFF_FFFF,
        }
    }

    /// Returns `true` if this ID entry matches `info`.
    #[must_use]
    pub fn matches(&self, info: &PciDeviceInfo) -> bool {
        if self.vendor != PCI_ANY_ID && self.vendor != info.vendor_id {
            return false;
        }
        if self.device != PCI_ANY_ID && self.device != info.device_id {
            return false;
        }
        if self.class_mask != 0 {
            let dev_class = ((info.class as u32) << 16)
                | ((info.subclass as u32) << 8)
                | (info.prog_if as u32);
            if (dev_class & self.class_mask) != (self.class & self.class_mask) {
                return false;
            }
        }
        true
    }
}

/// A decoded Base Address Register.
#[derive(Debug, Clone, Copy)]
pub enum PciBar {
    /// Memory-mapped BAR.
    Memory {
        /// Base physical address.
        base: u64,
        /// Size in bytes.
        size: u64,
        /// Whether the region is prefetchable.
        prefetchable: bool,
        /// Whether this is a 64-bit BAR (consumes two BAR slots).
        is_64bit: bool,
    },
    /// I/O port BAR.
    Io {
        /// Base I/O port.
        base: u32,
        /// Size in bytes.
        size: u32,
    },
    /// Slot unused, or consumed by the upper half of the preceding 64-bit
    /// memory BAR.
    Unused,
}

/// Full information about one discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDeviceInfo {
    /// Bus/device/function address.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Revision ID.
    pub revision: u8,
    /// Programming interface byte.
    pub prog_if: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Class code.
    pub class: u8,
    /// Header type: bits 0-6 the layout, bit 7 the multi-function flag.
    pub header_type: u8,
    /// Interrupt line (legacy IRQ assigned by firmware).
    pub interrupt_line: u8,
    /// Interrupt pin, 0 = none, 1..=4 = INTA..INTD.
    pub interrupt_pin: u8,
    /// Up to 6 BARs (type 1 headers use only the first 2).
    pub bars: [PciBar; 6],
}

impl PciDeviceInfo {
    /// `true` if this function is a PCI-to-PCI bridge (class 0x06,
    /// subclass 0x04), in which case `enumerate` recurses into its
    /// secondary bus number.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.class == 0x06 && self.subclass == 0x04
    }

    /// `true` if bit 7 of the header type marks this device
    /// multi-function, meaning functions 1..=7 should also be probed.
    #[must_use]
    pub fn is_multi_function(&self) -> bool {
        self.header_type & 0x80 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(vendor: u16, device: u16, class: u8, subclass: u8, prog_if: u8) -> PciDeviceInfo {
        PciDeviceInfo {
            address: PciAddress {
                bus: 0,
                device: 0,
                function: 0,
            },
            vendor_id: vendor,
            device_id: device,
            revision: 0,
            prog_if,
            subclass,
            class,
            header_type: 0,
            interrupt_line: 0,
            interrupt_pin: 0,
            bars: [PciBar::Unused; 6],
        }
    }

    #[test]
    fn exact_vendor_device_match() {
        let id = PciDeviceId::new(0x8086, 0x2918);
        assert!(id.matches(&info(0x8086, 0x2918, 0, 0, 0)));
        assert!(!id.matches(&info(0x1234, 0x2918, 0, 0, 0)));
    }

    #[test]
    fn nvme_class_matches_regardless_of_vendor() {
        let id = PciDeviceId::with_class_progif(0x01, 0x08, 0x02);
        assert!(id.matches(&info(0x8086, 0xABCD, 0x01, 0x08, 0x02)));
        assert!(id.matches(&info(0x1AF4, 0x0001, 0x01, 0x08, 0x02)));
        assert!(!id.matches(&info(0x8086, 0xABCD, 0x01, 0x06, 0x00)));
    }

    #[test]
    fn bridge_detection() {
        assert!(info(0, 0, 0x06, 0x04, 0).is_bridge());
        assert!(!info(0, 0, 0x01, 0x08, 2).is_bridge());
    }
}
