//! PCI bus enumeration over the ECAM window: walks bus/device/function
//! space, recursing into bridges and multi-function devices, and decodes
//! every function's BARs.

use alloc::vec::Vec;

use crate::device::{PciAddress, PciBar, PciDeviceInfo};
use crate::ecam;

mod regs {
    pub const VENDOR_ID: u16 = 0x00;
    pub const DEVICE_ID: u16 = 0x02;
    pub const REVISION: u16 = 0x08;
    pub const PROG_IF: u16 = 0x09;
    pub const SUBCLASS: u16 = 0x0A;
    pub const CLASS: u16 = 0x0B;
    pub const HEADER_TYPE: u16 = 0x0E;
    pub const BAR0: u16 = 0x10;
    pub const SECONDARY_BUS: u16 = 0x19;
    pub const INTERRUPT_LINE: u16 = 0x3C;
    pub const INTERRUPT_PIN: u16 = 0x3D;
}

/// Enumerates every PCI function reachable from bus 0, handling
/// multi-function host controllers and PCI-to-PCI bridges.
pub fn enumerate() -> Vec<PciDeviceInfo> {
    let mut devices = Vec::new();
    let header_type = ecam::read_u8(0, 0, 0, regs::HEADER_TYPE).unwrap_or(0);
    if header_type & 0x80 == 0 {
        enumerate_bus(0, &mut devices);
    } else {
        for func in 0..8u8 {
            if ecam::read_u16(0, 0, func, regs::VENDOR_ID).unwrap_or(0xFFFF) != 0xFFFF {
                enumerate_bus(func, &mut devices);
            }
        }
    }
    devices
}

fn enumerate_bus(bus: u8, devices: &mut Vec<PciDeviceInfo>) {
    for device in 0..32u8 {
        enumerate_device(bus, device, devices);
    }
}

fn enumerate_device(bus: u8, device: u8, devices: &mut Vec<PciDeviceInfo>) {
    let Some(vendor) = ecam::read_u16(bus, device, 0, regs::VENDOR_ID) else {
        return;
    };
    if vendor == 0xFFFF {
        return;
    }

    let info = read_device_info(bus, device, 0);
    let multi_function = info.is_multi_function();

    if info.is_bridge() {
        if let Some(secondary) = ecam::read_u8(bus, device, 0, regs::SECONDARY_BUS) {
            if secondary != 0 {
                enumerate_bus(secondary, devices);
            }
        }
    }
    devices.push(info);

    if !multi_function {
        return;
    }
    for func in 1..8u8 {
        if ecam::read_u16(bus, device, func, regs::VENDOR_ID).unwrap_or(0xFFFF) == 0xFFFF {
            continue;
        }
        let func_info = read_device_info(bus, device, func);
        if func_info.is_bridge() {
            if let Some(secondary) = ecam::read_u8(bus, device, func, regs::SECONDARY_BUS) {
                if secondary != 0 {
                    enumerate_bus(secondary, devices);
                }
            }
        }
        devices.push(func_info);
    }
}

fn read_device_info(bus: u8, device: u8, function: u8) -> PciDeviceInfo {
    let vendor_id = ecam::read_u16(bus, device, function, regs::VENDOR_ID).unwrap_or(0xFFFF);
    let device_id = ecam::read_u16(bus, device, function, regs::DEVICE_ID).unwrap_or(0xFFFF);
    let revision = ecam::read_u8(bus, device, function, regs::REVISION).unwrap_or(0);
    let prog_if = ecam::read_u8(bus, device, function, regs::PROG_IF).unwrap_or(0);
    let subclass = ecam::read_u8(bus, device, function, regs::SUBCLASS).unwrap_or(0);
    let class = ecam::read_u8(bus, device, function, regs::CLASS).unwrap_or(0);
    let header_type = ecam::read_u8(bus, device, function, regs::HEADER_TYPE).unwrap_or(0);
    let interrupt_line = ecam::read_u8(bus, device, function, regs::INTERRUPT_LINE).unwrap_or(0);
    let interrupt_pin = ecam::read_u8(bus, device, function, regs::INTERRUPT_PIN).unwrap_or(0);
    let bars = decode_bars(bus, device, function, header_type);

    PciDeviceInfo {
        address: PciAddress {
            bus,
            device,
            function,
        },
        vendor_id,
        device_id,
        revision,
        prog_if,
        subclass,
        class,
        header_type,
        interrupt_line,
        interrupt_pin,
        bars,
    }
}

/// Decodes Base Address Registers via the standard probe-with-all-ones
/// sizing algorithm. Type 0 headers carry up to 6 BARs, type 1 (bridge)
/// headers only 2.
fn decode_bars(bus: u8, device: u8, function: u8, header_type: u8) -> [PciBar; 6] {
    let mut bars = [PciBar::Unused; 6];
    let max_bars: usize = if header_type & 0x7F == 1 { 2 } else { 6 };

    let mut i = 0;
    while i < max_bars {
        let offset = regs::BAR0 + (i as u16) * 4;

        let Some(original) = ecam::read_u32(bus, device, function, offset) else {
            break;
        };
        ecam::write_u32(bus, device, function, offset, 0xFFFF_FFFF);
        let sizing = ecam::read_u32(bus, device, function, offset).unwrap_or(0);
        ecam::write_u32(bus, device, function, offset, original);

        if sizing == 0 || sizing == 0xFFFF_FFFF {
            i += 1;
            continue;
        }

        if original & 1 != 0 {
            let mask = sizing & !0x03;
            let size = (!mask).wrapping_add(1) & 0xFFFF;
            if size > 0 {
                bars[i] = PciBar::Io {
                    base: original & !0x03,
                    size,
                };
            }
            i += 1;
            continue;
        }

        let bar_type = (original >> 1) & 0x03;
        let prefetchable = original & 0x08 != 0;
        let is_64bit = bar_type == 2;

        if is_64bit && i + 1 < max_bars {
            let next_offset = regs::BAR0 + ((i + 1) as u16) * 4;
            let original_high = ecam::read_u32(bus, device, function, next_offset).unwrap_or(0);
            ecam::write_u32(bus, device, function, next_offset, 0xFFFF_FFFF);
            let sizing_high = ecam::read_u32(bus, device, function, next_offset).unwrap_or(0);
            ecam::write_u32(bus, device, function, next_offset, original_high);

            let base = (u64::from(original_high) << 32) | u64::from(original & !0x0F);
            let mask64 = (u64::from(sizing_high) << 32) | u64::from(sizing & !0x0F);
            let size = (!mask64).wrapping_add(1);

            bars[i] = PciBar::Memory {
                base,
                size,
                prefetchable,
                is_64bit: true,
            };
            i += 2;
        } else {
            let mask = sizing & !0x0F;
            let size = u64::from((!mask).wrapping_add(1));
            bars[i] = PciBar::Memory {
                base: u64::from(original & !0x0F),
                size,
                prefetchable,
                is_64bit: false,
            };
            i += 1;
        }
    }

    bars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecam::{set_ecam_region, EcamRegion};

    // `enumerate` over an unmapped ECAM window (all reads return 0xFFFF
    // vendor IDs) yields no devices; exercises the early-return paths
    // without requiring real hardware.
    #[test]
    fn enumerate_over_unset_region_is_empty() {
        set_ecam_region(EcamRegion {
            phys_base: u64::MAX,
            start_bus: 0,
            end_bus: 0,
            hhdm_offset: 0,
        });
        assert!(enumerate().is_empty());
    }
}
