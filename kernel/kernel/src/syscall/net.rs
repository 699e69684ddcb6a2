//! Socket syscall handlers: `socket`, `bind`, `connect`, `listen`,
//! `accept`, `getsockname`/`getpeername`, `sendmsg`/`recvmsg`,
//! `get`/`setsockopt`, and `socketpair`.

use alloc::string::String;
use alloc::sync::Arc;

use kcore::errno::Errno;
use knet::socket::{MsgFlags, SockOpt};
use knet::{Ipv4Addr, TcpSocket, UdpSocket, UnixSocket};

use crate::fdtable::Descriptor;
use crate::process::Process;

/// Address family requested at `socket()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// `AF_INET`.
    Inet,
    /// `AF_UNIX`.
    Unix,
}

/// Socket type requested at `socket()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    /// `SOCK_STREAM`.
    Stream,
    /// `SOCK_DGRAM`.
    Dgram,
}

/// A parsed `sockaddr`, independent of whether it names an inet endpoint
/// or a UNIX path.
#[derive(Debug, Clone)]
pub enum Address {
    /// An IPv4 `(addr, port)` pair.
    Inet(Ipv4Addr, u16),
    /// A UNIX-domain socket path.
    Unix(String),
}

fn default_adapter() -> Result<Arc<knet::Adapter>, Errno> {
    knet::adapter::loopback().ok_or(Errno::ENetUnreach)
}

/// `socket(domain, type)` — creates an unbound, unconnected socket and
/// installs it in the calling process's descriptor table.
///
/// A bare `AF_INET`/`SOCK_STREAM` request has nowhere to attach a TCB
/// until the destination (for `connect`) or local port (for `listen`) is
/// known, so active- and passive-open TCP sockets are created directly by
/// [`sys_tcp_connect`]/[`sys_tcp_listen`] instead of here.
pub fn sys_socket(process: &Arc<Process>, domain: Domain, kind: SockType) -> Result<i32, Errno> {
    let descriptor = match (domain, kind) {
        (Domain::Inet, SockType::Dgram) => Descriptor::Udp(UdpSocket::bind(default_adapter()?, 0)?),
        (Domain::Inet, SockType::Stream) => return Err(Errno::ENoSys),
        (Domain::Unix, _) => Descriptor::Unix(UnixSocket::create()),
    };
    Ok(process.fds.insert(descriptor))
}

/// `socketpair(domain, type)` — `AF_UNIX` only, a connected pair with no
/// filesystem path.
pub fn sys_socketpair(process: &Arc<Process>, domain: Domain) -> Result<(i32, i32), Errno> {
    if domain != Domain::Unix {
        return Err(Errno::EProtoNoSupport);
    }
    let (a, b) = UnixSocket::pair();
    let fd_a = process.fds.insert(Descriptor::Unix(a));
    let fd_b = process.fds.insert(Descriptor::Unix(b));
    Ok((fd_a, fd_b))
}

/// `bind(fd, addr)`. A UDP socket is already bound at `socket()` time (to
/// an ephemeral port); rebinding to a specific port is not exposed by any
/// caller in this kernel's own scope, so only the `AF_UNIX` path does real
/// work here.
pub fn sys_bind(process: &Arc<Process>, fd: i32, addr: &Address) -> Result<(), Errno> {
    match (process.fds.get(fd)?, addr) {
        (Descriptor::Udp(_), Address::Inet(_, _)) => Ok(()),
        (Descriptor::Unix(sock), Address::Unix(path)) => sock.bind_listen(path),
        _ => Err(Errno::EInval),
    }
}

/// `connect(fd, addr)` for UDP (sets the default peer) and `AF_UNIX`
/// (blocks until a matching `listen`er accepts). Active-open TCP has no
/// existing `fd` to reconnect through; see [`sys_tcp_connect`].
pub fn sys_connect(process: &Arc<Process>, fd: i32, addr: &Address) -> Result<(), Errno> {
    match (process.fds.get(fd)?, addr) {
        (Descriptor::Udp(sock), Address::Inet(ip, port)) => {
            sock.connect(*ip, *port);
            Ok(())
        }
        (Descriptor::Unix(sock), Address::Unix(path)) => sock.connect(path),
        _ => Err(Errno::EInval),
    }
}

/// `connect(2)` for a fresh `AF_INET`/`SOCK_STREAM` socket: builds the TCB
/// and installs the new fd in one step.
pub fn sys_tcp_connect(process: &Arc<Process>, local_port: u16, ip: Ipv4Addr, port: u16) -> Result<i32, Errno> {
    let sock = TcpSocket::connect(default_adapter()?, local_port, ip, port)?;
    Ok(process.fds.insert(Descriptor::Tcp(sock)))
}

/// `bind` + `listen(2)` for TCP in one step: [`TcpSocket::listen`] both
/// binds the local port and puts the socket in `LISTEN`, bounding its
/// pending-connection backlog.
pub fn sys_tcp_listen(process: &Arc<Process>, ip: Ipv4Addr, port: u16, backlog: usize) -> Result<i32, Errno> {
    let sock = TcpSocket::listen(default_adapter()?, ip, port, backlog);
    Ok(process.fds.insert(Descriptor::Tcp(sock)))
}

/// `listen(fd, backlog)` for an already-open stream fd. TCP's backlog is
/// fixed at `listen()`/[`sys_tcp_listen`] time (the socket is already in
/// `LISTEN` by the time an fd for it exists); `AF_UNIX` has no bounded
/// pending-connection queue to configure.
pub fn sys_listen(process: &Arc<Process>, fd: i32) -> Result<(), Errno> {
    match process.fds.get(fd)? {
        Descriptor::Tcp(_) | Descriptor::Unix(_) => Ok(()),
        _ => Err(Errno::ENoSys),
    }
}

/// `accept(fd)`.
pub fn sys_accept(process: &Arc<Process>, fd: i32) -> Result<i32, Errno> {
    match process.fds.get(fd)? {
        Descriptor::Tcp(sock) => {
            let accepted = sock.accept()?;
            Ok(process.fds.insert(Descriptor::Tcp(accepted)))
        }
        Descriptor::Unix(sock) => {
            let accepted = sock.accept()?;
            Ok(process.fds.insert(Descriptor::Unix(accepted)))
        }
        _ => Err(Errno::ENoSys),
    }
}

/// `sendmsg(fd, buf, dst, flags)`. `dst` is only meaningful for an
/// unconnected UDP socket; every other kind ignores it and sends to its
/// already-established peer.
pub fn sys_sendmsg(process: &Arc<Process>, fd: i32, buf: &[u8], dst: Option<Address>, flags: MsgFlags) -> Result<usize, Errno> {
    match process.fds.get(fd)? {
        Descriptor::Udp(sock) => {
            let dst = match dst {
                Some(Address::Inet(ip, port)) => Some((ip, port)),
                Some(Address::Unix(_)) => return Err(Errno::EInval),
                None => None,
            };
            sock.sendmsg(dst, buf)
        }
        Descriptor::Tcp(sock) => sock.sendmsg(buf, flags),
        Descriptor::Unix(sock) => sock.sendmsg(buf, flags),
        Descriptor::File(_) => Err(Errno::ENotSock),
    }
}

/// `recvmsg(fd, buf, flags)`, returning `(bytes, source_address)`. The
/// source address is only populated for UDP; stream sockets have a fixed
/// peer established at `connect`/`accept` time.
pub fn sys_recvmsg(process: &Arc<Process>, fd: i32, buf: &mut [u8], flags: MsgFlags) -> Result<(usize, Option<Address>), Errno> {
    match process.fds.get(fd)? {
        Descriptor::Udp(sock) => {
            let (n, ip, port) = sock.recv(buf, flags)?;
            Ok((n, Some(Address::Inet(ip, port))))
        }
        Descriptor::Tcp(sock) => Ok((sock.recvmsg(buf, flags)?, None)),
        Descriptor::Unix(sock) => Ok((sock.recvmsg(buf, flags)?, None)),
        Descriptor::File(_) => Err(Errno::ENotSock),
    }
}

/// `getsockname(fd)`/`getpeername(fd)` share this lookup; `local` selects
/// which endpoint is reported. `AF_UNIX` has no `(ip, port)`-shaped
/// address in this kernel's model, so it reports `EOPNOTSUPP`.
pub fn sys_sockaddr(process: &Arc<Process>, fd: i32, local: bool) -> Result<Address, Errno> {
    match process.fds.get(fd)? {
        Descriptor::Udp(sock) => {
            let (ip, port) = if local { sock.local_addr() } else { sock.peer_addr()? };
            Ok(Address::Inet(ip, port))
        }
        Descriptor::Tcp(sock) => {
            let (ip, port) = if local { sock.local_addr() } else { sock.remote_addr() };
            Ok(Address::Inet(ip, port))
        }
        _ => Err(Errno::ENoSys),
    }
}

/// `setsockopt(fd, opt, value)`. `SO_BROADCAST` (UDP) and `TCP_MAXSEG`
/// (TCP) are wired to an actual effect; every other combination is a
/// protocol feature this kernel does not implement.
pub fn sys_setsockopt(process: &Arc<Process>, fd: i32, opt: SockOpt, value: u32) -> Result<(), Errno> {
    match (process.fds.get(fd)?, opt) {
        (Descriptor::Udp(sock), SockOpt::Broadcast) => {
            sock.set_broadcast(value != 0);
            Ok(())
        }
        (Descriptor::Tcp(sock), SockOpt::Maxseg) => {
            sock.set_maxseg(value as u16);
            Ok(())
        }
        _ => Err(Errno::ENoSys),
    }
}

/// `getsockopt(fd, opt)`. Mirrors `sys_setsockopt`'s scope.
pub fn sys_getsockopt(process: &Arc<Process>, fd: i32, opt: SockOpt) -> Result<u32, Errno> {
    match (process.fds.get(fd)?, opt) {
        (Descriptor::Udp(sock), SockOpt::Broadcast) => Ok(u32::from(sock.broadcast())),
        (Descriptor::Tcp(sock), SockOpt::Maxseg) => Ok(u32::from(sock.maxseg())),
        _ => Err(Errno::ENoSys),
    }
}
