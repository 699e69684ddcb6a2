//! Syscall dispatch.
//!
//! The teacher's dispatch table forwards raw `usize` register pairs to
//! handlers that validate them into [`UserSlice`]s before touching
//! anything; that validation layer belongs to an architecture crate this
//! workspace does not have. Handlers here instead take already-typed
//! arguments (`&str`, `&[u8]`, enums) — whatever decodes the raw
//! registers into those values is the architecture layer's job, not
//! this crate's.

pub mod fs;
pub mod mm;
pub mod misc;
pub mod net;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::log::LogLevel;
use kfs::vfs::NodeKind;
use kfs::{Mode, Stat, Vfs};

use crate::logsetup::TARGET_SYSCALL;
use crate::process::Process;
use mm::{sys_mmap, sys_mprotect, sys_munmap};
use misc::{sys_debug, sys_futex_wait, sys_futex_wake, sys_getclock, sys_pipe, sys_sleep, sys_umask, sys_uname, ClockId, Uname};
use net::{sys_accept, sys_bind, sys_connect, sys_getsockopt, sys_listen, sys_recvmsg, sys_sendmsg, sys_setsockopt, sys_sockaddr, sys_socket, sys_socketpair, sys_tcp_connect, sys_tcp_listen, Address, Domain, SockType};

/// One decoded syscall request, already carrying typed arguments.
///
/// Named to mirror the exact surface this kernel implements: no
/// process-lifecycle calls (`fork`/`exec`/`wait`/`exit`/`kill`) exist in
/// that surface, so none appear here either.
pub enum Syscall<'a> {
    Openat { path: &'a str, flags: kfs::fd::OpenFlags },
    Stat { path: &'a str },
    Getcwd,
    Chdir { path: &'a str },
    Readdir { fd: i32 },
    Readlinkat { path: &'a str },
    Linkat { existing: &'a str, new: &'a str },
    Unlinkat { path: &'a str },
    Mkdirat { path: &'a str, mode: Mode },
    Mmap { hint: kcore::addr::VirtAddr, len: u64, prot: kmm::mmap::Prot, flags: kmm::mmap::MmapFlags, fd: Option<i32>, offset: u64 },
    Munmap { addr: kcore::addr::VirtAddr, len: u64 },
    Mprotect { addr: kcore::addr::VirtAddr, len: u64, prot: kmm::mmap::Prot },
    Pipe,
    Socket { domain: Domain, kind: SockType },
    Socketpair { domain: Domain },
    Bind { fd: i32, addr: Address },
    Connect { fd: i32, addr: Address },
    TcpConnect { local_port: u16, ip: knet::Ipv4Addr, port: u16 },
    TcpListen { ip: knet::Ipv4Addr, port: u16, backlog: usize },
    Listen { fd: i32 },
    Accept { fd: i32 },
    Getsockname { fd: i32 },
    Getpeername { fd: i32 },
    Sendmsg { fd: i32, buf: &'a [u8], dst: Option<Address>, flags: knet::MsgFlags },
    Recvmsg { fd: i32, buf: &'a mut [u8], flags: knet::MsgFlags },
    Getsockopt { fd: i32, opt: knet::SockOpt },
    Setsockopt { fd: i32, opt: knet::SockOpt, value: u32 },
    Sleep { millis: u64 },
    Getclock { which: ClockId },
    FutexWait { key: usize, expected: u32, current: u32 },
    FutexWake { key: usize, max_waiters: u32 },
    Umask { new_mask: Mode },
    Uname,
    Debug { message: &'a str },
}

/// The value a syscall handler hands back to its caller on success;
/// variants cover every return shape the surface above needs.
#[derive(Debug)]
pub enum SyscallResult {
    Unit,
    Fd(i32),
    FdPair(i32, i32),
    U64(u64),
    USize(usize),
    Addr(kcore::addr::VirtAddr),
    Stat(Stat),
    Path(String),
    Entries(Vec<(String, NodeKind)>),
    SymlinkTarget(String),
    Bytes(usize),
    RecvResult(usize, Option<Address>),
    Sockaddr(Address),
    Sockopt(u32),
    Mode(Mode),
    Uname(Uname),
}

fn name(call: &Syscall<'_>) -> &'static str {
    match call {
        Syscall::Openat { .. } => "openat",
        Syscall::Stat { .. } => "stat",
        Syscall::Getcwd => "getcwd",
        Syscall::Chdir { .. } => "chdir",
        Syscall::Readdir { .. } => "readdir",
        Syscall::Readlinkat { .. } => "readlinkat",
        Syscall::Linkat { .. } => "linkat",
        Syscall::Unlinkat { .. } => "unlinkat",
        Syscall::Mkdirat { .. } => "mkdirat",
        Syscall::Mmap { .. } => "mmap",
        Syscall::Munmap { .. } => "munmap",
        Syscall::Mprotect { .. } => "mprotect",
        Syscall::Pipe => "pipe",
        Syscall::Socket { .. } => "socket",
        Syscall::Socketpair { .. } => "socketpair",
        Syscall::Bind { .. } => "bind",
        Syscall::Connect { .. } | Syscall::TcpConnect { .. } => "connect",
        Syscall::TcpListen { .. } | Syscall::Listen { .. } => "listen",
        Syscall::Accept { .. } => "accept",
        Syscall::Getsockname { .. } => "getsockname",
        Syscall::Getpeername { .. } => "getpeername",
        Syscall::Sendmsg { .. } => "sendmsg",
        Syscall::Recvmsg { .. } => "recvmsg",
        Syscall::Getsockopt { .. } => "getsockopt",
        Syscall::Setsockopt { .. } => "setsockopt",
        Syscall::Sleep { .. } => "sleep",
        Syscall::Getclock { .. } => "getclock",
        Syscall::FutexWait { .. } => "futex_wait",
        Syscall::FutexWake { .. } => "futex_wake",
        Syscall::Umask { .. } => "umask",
        Syscall::Uname => "uname",
        Syscall::Debug { .. } => "debug",
    }
}

/// Executes `call` on behalf `process`, consulting `vfs` for the
/// filesystem-shaped calls. Logs entry and leave (with the decoded errno
/// name on failure) at debug level under the `syscall` target.
pub fn dispatch(process: &Arc<Process>, vfs: &Vfs, call: Syscall<'_>) -> Result<SyscallResult, Errno> {
    let call_name = name(&call);
    kcore::klog_target!(LogLevel::Debug, TARGET_SYSCALL, "enter {call_name}");

    let result = run(process, vfs, call);

    match &result {
        Ok(_) => kcore::klog_target!(LogLevel::Debug, TARGET_SYSCALL, "leave {call_name} -> ok"),
        Err(err) => kcore::klog_target!(LogLevel::Debug, TARGET_SYSCALL, "leave {call_name} -> {}", err.name()),
    }
    result
}

fn run(process: &Arc<Process>, vfs: &Vfs, call: Syscall<'_>) -> Result<SyscallResult, Errno> {
    match call {
        Syscall::Openat { path, flags } => fs::sys_openat(process, vfs, path, flags).map(SyscallResult::Fd),
        Syscall::Stat { path } => fs::sys_stat(process, vfs, path).map(SyscallResult::Stat),
        Syscall::Getcwd => Ok(SyscallResult::Path(fs::sys_getcwd(process, vfs))),
        Syscall::Chdir { path } => fs::sys_chdir(process, vfs, path).map(|()| SyscallResult::Unit),
        Syscall::Readdir { fd } => fs::sys_readdir(process, fd).map(SyscallResult::Entries),
        Syscall::Readlinkat { path } => fs::sys_readlinkat(process, vfs, path).map(SyscallResult::SymlinkTarget),
        Syscall::Linkat { existing, new } => fs::sys_linkat(process, vfs, existing, new).map(|()| SyscallResult::Unit),
        Syscall::Unlinkat { path } => fs::sys_unlinkat(process, vfs, path).map(|()| SyscallResult::Unit),
        Syscall::Mkdirat { path, mode } => fs::sys_mkdirat(process, vfs, path, mode).map(|_node| SyscallResult::Unit),

        Syscall::Mmap { hint, len, prot, flags, fd, offset } => sys_mmap(process, hint, len, prot, flags, fd, offset).map(SyscallResult::Addr),
        Syscall::Munmap { addr, len } => sys_munmap(process, addr, len).map(|()| SyscallResult::Unit),
        Syscall::Mprotect { addr, len, prot } => sys_mprotect(process, addr, len, prot).map(|()| SyscallResult::Unit),

        Syscall::Pipe => {
            let (r, w) = sys_pipe(process);
            Ok(SyscallResult::FdPair(r, w))
        }
        Syscall::Socket { domain, kind } => sys_socket(process, domain, kind).map(SyscallResult::Fd),
        Syscall::Socketpair { domain } => sys_socketpair(process, domain).map(|(a, b)| SyscallResult::FdPair(a, b)),
        Syscall::Bind { fd, addr } => sys_bind(process, fd, &addr).map(|()| SyscallResult::Unit),
        Syscall::Connect { fd, addr } => sys_connect(process, fd, &addr).map(|()| SyscallResult::Unit),
        Syscall::TcpConnect { local_port, ip, port } => sys_tcp_connect(process, local_port, ip, port).map(SyscallResult::Fd),
        Syscall::TcpListen { ip, port, backlog } => sys_tcp_listen(process, ip, port, backlog).map(SyscallResult::Fd),
        Syscall::Listen { fd } => sys_listen(process, fd).map(|()| SyscallResult::Unit),
        Syscall::Accept { fd } => sys_accept(process, fd).map(SyscallResult::Fd),
        Syscall::Getsockname { fd } => sys_sockaddr(process, fd, true).map(SyscallResult::Sockaddr),
        Syscall::Getpeername { fd } => sys_sockaddr(process, fd, false).map(SyscallResult::Sockaddr),
        Syscall::Sendmsg { fd, buf, dst, flags } => sys_sendmsg(process, fd, buf, dst, flags).map(SyscallResult::Bytes),
        Syscall::Recvmsg { fd, buf, flags } => sys_recvmsg(process, fd, buf, flags).map(|(n, addr)| SyscallResult::RecvResult(n, addr)),
        Syscall::Getsockopt { fd, opt } => sys_getsockopt(process, fd, opt).map(SyscallResult::Sockopt),
        Syscall::Setsockopt { fd, opt, value } => sys_setsockopt(process, fd, opt, value).map(|()| SyscallResult::Unit),

        Syscall::Sleep { millis } => {
            sys_sleep(millis);
            Ok(SyscallResult::Unit)
        }
        Syscall::Getclock { which } => Ok(SyscallResult::U64(sys_getclock(which))),
        Syscall::FutexWait { key, expected, current } => sys_futex_wait(key, expected, current).map(|()| SyscallResult::Unit),
        Syscall::FutexWake { key, max_waiters } => Ok(SyscallResult::USize(sys_futex_wake(key, max_waiters))),
        Syscall::Umask { new_mask } => Ok(SyscallResult::Mode(sys_umask(process, new_mask))),
        Syscall::Uname => Ok(SyscallResult::Uname(sys_uname())),
        Syscall::Debug { message } => {
            sys_debug(message);
            Ok(SyscallResult::Unit)
        }
    }
}
