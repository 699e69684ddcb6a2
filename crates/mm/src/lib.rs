//! Physical and virtual memory management: bitmap frame allocator, 4-level
//! page table walker, mmap range tracking, and the kernel slab heap.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fault;
pub mod mapper;
pub mod mmap;
pub mod pmm;
pub mod slab;
pub mod vmm;

pub use fault::{FaultError, PageSource, resolve_fault};
pub use mapper::{MapFlags, MapFlush, UnmapError};
pub use mmap::{GlobalRange, MmapFlags, MmapRange, MmapSpace, Prot};
pub use pmm::{BitmapAllocator, MemoryMapEntry, Pmm, PmmStats};
pub use slab::SlabAllocator;
pub use vmm::{AddressSpace, VmmError};
