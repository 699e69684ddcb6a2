//! Kernel glue: boot hand-off, the process/fd/mmap data model, syscall
//! dispatch, and the panic handler tying the rest of the workspace's
//! crates together into one bootable kernel.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod boot;
pub mod fdtable;
pub mod fsinit;
pub mod futex;
pub mod logsetup;
pub mod panic;
pub mod pipe;
pub mod process;
pub mod serial;
pub mod syscall;

pub use boot::{kernel_init, BootInfo};
pub use process::Process;
