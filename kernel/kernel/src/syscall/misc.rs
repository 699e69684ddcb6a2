//! The remaining syscall handlers with no module of their own: `pipe`,
//! `sleep`, `getclock`, `futex_wait`/`futex_wake`, `umask`, `uname`, and
//! `debug`.

use alloc::sync::Arc;

use kcore::errno::Errno;
use kfs::fd::OpenFlags;
use kfs::stat::Mode;
use ksched::event::Event;
use ksched::timer::TIMERS;

use crate::fdtable::Descriptor;
use crate::futex;
use crate::pipe;
use crate::process::Process;

/// Which clock `getclock` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    /// Milliseconds since boot.
    Monotonic,
    /// Milliseconds since the Unix epoch.
    Realtime,
}

/// Kernel identification returned by `uname`.
#[derive(Debug, Clone, Copy)]
pub struct Uname {
    /// Operating system name.
    pub sysname: &'static str,
    /// Kernel release string.
    pub release: &'static str,
    /// Build/version string.
    pub version: &'static str,
    /// Hardware architecture.
    pub machine: &'static str,
}

const UNAME: Uname = Uname {
    sysname: "kestrel",
    release: env!("CARGO_PKG_VERSION"),
    version: concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")"),
    machine: "x86_64",
};

/// `pipe()`, installing both ends in the calling process's fd table and
/// returning `(read_fd, write_fd)`.
pub fn sys_pipe(process: &Arc<Process>) -> (i32, i32) {
    let (read_node, write_node) = pipe::create();
    let read_fd = process.fds.insert(Descriptor::File(kfs::OpenFileDescription::new(
        read_node.clone(),
        read_node.resource.clone(),
        OpenFlags::RDONLY,
    )));
    let write_fd = process.fds.insert(Descriptor::File(kfs::OpenFileDescription::new(
        write_node.clone(),
        write_node.resource.clone(),
        OpenFlags::WRONLY,
    )));
    (read_fd, write_fd)
}

/// `sleep(millis)`: blocks the calling thread for at least `millis`
/// milliseconds, using a private, single-fire event armed on the global
/// timer set.
pub fn sys_sleep(millis: u64) {
    if millis == 0 {
        return;
    }
    let event = Arc::new(Event::new());
    TIMERS.arm(millis, event.clone());
    ksched::event_await(&[&event], true);
}

/// `getclock(which)`, in milliseconds.
#[must_use]
pub fn sys_getclock(which: ClockId) -> u64 {
    match which {
        ClockId::Monotonic => TIMERS.monotonic_ms(),
        ClockId::Realtime => TIMERS.realtime_ms(),
    }
}

/// `futex_wait(key, expected, current)`.
pub fn sys_futex_wait(key: usize, expected: u32, current: u32) -> Result<(), Errno> {
    futex::wait(key, expected, current)
}

/// `futex_wake(key, max_waiters)`, returning the number actually woken.
pub fn sys_futex_wake(key: usize, max_waiters: u32) -> usize {
    futex::wake(key, max_waiters)
}

/// `umask(new_mask)`, returning the previous mask.
pub fn sys_umask(process: &Arc<Process>, new_mask: Mode) -> Mode {
    process.set_umask(new_mask)
}

/// `uname()`.
#[must_use]
pub fn sys_uname() -> Uname {
    UNAME
}

/// `debug(message)`: writes `message` straight to the kernel log at debug
/// level, for userspace diagnostics that don't warrant a real log target.
pub fn sys_debug(message: &str) {
    kcore::kdebug!("{message}");
}
