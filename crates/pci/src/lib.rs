//! PCI configuration-space access, bus enumeration, and BAR decoding.
//!
//! Drivers (NVMe in particular, via `kstorage`) call [`enumerate::enumerate`]
//! once at boot and match the returned [`device::PciDeviceInfo`] list
//! against their [`device::PciDeviceId`] to find the function(s) they
//! should attach to.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod ecam;
pub mod enumerate;

pub use device::{Command, PciAddress, PciBar, PciDeviceId, PciDeviceInfo, PCI_ANY_ID};
pub use ecam::{EcamRegion, set_ecam_region};
pub use enumerate::enumerate;
