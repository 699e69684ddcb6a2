//! The socket-layer primitives shared by UDP, TCP, and UNIX-domain sockets:
//! poll readiness flags, message flags, and the non-blocking predicate that
//! unifies `O_NONBLOCK` (a per-description status flag) with `MSG_DONTWAIT`
//! (a per-call flag) at the syscall boundary.

bitflags::bitflags! {
    /// Readiness bits reported by poll/select-shaped calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        /// Data available to read without blocking.
        const POLLIN = 1 << 0;
        /// Space available to write without blocking.
        const POLLOUT = 1 << 1;
        /// Peer closed or connection reset.
        const POLLHUP = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `sendmsg`/`recvmsg`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Do not block even if the description is otherwise blocking.
        const DONTWAIT = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Socket-level status flags, set via `fcntl`/`setsockopt`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u32 {
        /// The description itself is non-blocking (`O_NONBLOCK`).
        const NONBLOCK = 1 << 0;
        /// The socket is connected (peer address set via `connect`).
        const CONNECTED = 1 << 1;
        /// `SO_BROADCAST`: permitted to send to a broadcast destination.
        const BROADCAST = 1 << 2;
    }
}

/// `true` if a call with `msg_flags` on a description carrying
/// `socket_flags` should behave non-blocking, merging `O_NONBLOCK` and
/// `MSG_DONTWAIT` into the single predicate every recv/send path consults.
#[must_use]
pub fn is_nonblocking(socket_flags: SocketFlags, msg_flags: MsgFlags) -> bool {
    socket_flags.contains(SocketFlags::NONBLOCK) || msg_flags.contains(MsgFlags::DONTWAIT)
}

/// The common surface every socket kind (UDP, TCP, UNIX-domain) exposes to
/// poll/select-shaped callers, mirroring the per-type operation table a C
/// kernel would hang off a base `struct socket`.
pub trait Socket: Send + Sync {
    /// Current readiness.
    fn poll(&self) -> PollFlags;
}

/// Socket option identifiers, spanning both `SOL_SOCKET` (shared by UDP and
/// TCP) and protocol-specific levels such as `IPPROTO_TCP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    /// `SO_BROADCAST`.
    Broadcast,
    /// `IPPROTO_TCP` / `TCP_MAXSEG`: the negotiated or requested MSS.
    Maxseg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn either_flag_makes_the_call_nonblocking() {
        assert!(is_nonblocking(SocketFlags::NONBLOCK, MsgFlags::empty()));
        assert!(is_nonblocking(SocketFlags::empty(), MsgFlags::DONTWAIT));
        assert!(!is_nonblocking(SocketFlags::empty(), MsgFlags::empty()));
    }
}
