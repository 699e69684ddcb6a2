//! Wires a concrete output sink into [`kcore::log`]'s global function
//! pointers, and the per-subsystem target strings passed to
//! [`kcore::klog_target!`] throughout the other crates.

use kcore::log::LogLevel;

/// Target string for allocator/paging/mmap logging.
pub const TARGET_MM: &str = "mm";
/// Target string for scheduler/event/timer logging.
pub const TARGET_SCHED: &str = "sched";
/// Target string for VFS/fd-table logging.
pub const TARGET_FS: &str = "fs";
/// Target string for the IPv4/TCP/UDP/UNIX socket stack.
pub const TARGET_NET: &str = "net";
/// Target string for the NVMe driver and block cache.
pub const TARGET_NVME: &str = "nvme";
/// Target string for PCI enumeration and BAR decoding.
pub const TARGET_PCI: &str = "pci";
/// Target string for syscall entry/leave tracing.
pub const TARGET_SYSCALL: &str = "syscall";

fn print(args: core::fmt::Arguments<'_>) {
    crate::serial::write_fmt(args);
}

fn log(level: LogLevel, args: core::fmt::Arguments<'_>) {
    crate::serial::write_fmt(format_args!("[{}] {}\n", level.name(), args));
}

/// Registers the serial-backed print/log sinks. Call once, as early in
/// boot as the serial port is usable.
///
/// # Safety
///
/// Must be called before any other CPU is started, and before any code
/// calls `kprint!`/`klog!` concurrently with this registration.
pub unsafe fn init() {
    // SAFETY: `print`/`log` are safe to call from any context; caller
    // certifies single-threaded boot-time registration.
    unsafe {
        kcore::log::set_print_fn(print);
        kcore::log::set_log_fn(log);
    }
}
