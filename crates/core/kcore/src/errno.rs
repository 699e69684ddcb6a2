//! The POSIX-shaped errno set returned at the syscall boundary.
//!
//! Every fallible kernel-internal operation that can reach a syscall
//! returns `Result<T, Errno>`; the syscall dispatch table (see the `kernel`
//! crate) converts `Err(e)` into the `(-1, e as isize)` pair a caller
//! expects.

/// An error code from the POSIX errno namespace, restricted to the subset
/// this kernel actually produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Resource temporarily unavailable (non-blocking operation would block).
    EAgain = 11,
    /// Bad file descriptor.
    EBadf = 9,
    /// Device or resource busy.
    EBusy = 16,
    /// Connection refused.
    EConnRefused = 111,
    /// Connection reset by peer.
    EConnReset = 104,
    /// Destination address required.
    EDestAddrReq = 89,
    /// File exists.
    EExist = 17,
    /// Bad address.
    EFault = 14,
    /// Interrupted system call.
    EIntr = 4,
    /// Socket is already connected.
    EIsConn = 106,
    /// Is a directory.
    EIsDir = 21,
    /// Invalid argument.
    EInval = 22,
    /// I/O error.
    EIo = 5,
    /// Too many levels of symbolic links.
    ELoop = 40,
    /// Message too long.
    EMsgSize = 90,
    /// Network is unreachable.
    ENetUnreach = 101,
    /// Name too long.
    ENameTooLong = 36,
    /// No such device.
    ENoDev = 19,
    /// No buffer space available.
    ENoBufs = 105,
    /// No such file or directory.
    ENoEnt = 2,
    /// Out of memory.
    ENoMem = 12,
    /// Function not implemented.
    ENoSys = 38,
    /// Socket is not connected.
    ENotConn = 107,
    /// Not a directory.
    ENotDir = 20,
    /// Socket operation on non-socket.
    ENotSock = 88,
    /// Operation not permitted.
    EPerm = 1,
    /// Broken pipe.
    EPipe = 32,
    /// Protocol not supported.
    EProtoNoSupport = 93,
    /// Protocol wrong type for socket.
    EProtoType = 91,
    /// Result too large / out of range.
    ERange = 34,
    /// Connection timed out.
    ETimedOut = 110,
    /// Operation would block (distinct errno value from `EAGAIN` on some
    /// platforms; kernel treats the two identically).
    EWouldBlock = 11,
    /// Cross-device link.
    EXDev = 18,
}

impl Errno {
    /// Returns the fixed-width name used in `DEBUG_SYSCALL_ENTER`/`LEAVE`
    /// trace lines (spec's user-visible syscall logging).
    pub const fn name(self) -> &'static str {
        match self {
            Self::EAgain => "EAGAIN",
            Self::EBadf => "EBADF",
            Self::EBusy => "EBUSY",
            Self::EConnRefused => "ECONNREFUSED",
            Self::EConnReset => "ECONNRESET",
            Self::EDestAddrReq => "EDESTADDRREQ",
            Self::EExist => "EEXIST",
            Self::EFault => "EFAULT",
            Self::EIntr => "EINTR",
            Self::EIsConn => "EISCONN",
            Self::EIsDir => "EISDIR",
            Self::EInval => "EINVAL",
            Self::EIo => "EIO",
            Self::ELoop => "ELOOP",
            Self::EMsgSize => "EMSGSIZE",
            Self::ENetUnreach => "ENETUNREACH",
            Self::ENameTooLong => "ENAMETOOLONG",
            Self::ENoDev => "ENODEV",
            Self::ENoBufs => "ENOBUFS",
            Self::ENoEnt => "ENOENT",
            Self::ENoMem => "ENOMEM",
            Self::ENoSys => "ENOSYS",
            Self::ENotConn => "ENOTCONN",
            Self::ENotDir => "ENOTDIR",
            Self::ENotSock => "ENOTSOCK",
            Self::EPerm => "EPERM",
            Self::EPipe => "EPIPE",
            Self::EProtoNoSupport => "EPROTONOSUPPORT",
            Self::EProtoType => "EPROTOTYPE",
            Self::ERange => "ERANGE",
            Self::ETimedOut => "ETIMEDOUT",
            Self::EWouldBlock => "EWOULDBLOCK",
            Self::EXDev => "EXDEV",
        }
    }

    /// The raw numeric errno value, as returned across the syscall boundary.
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Convenience alias for syscall-shaped results throughout the kernel.
pub type KResult<T> = Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trips_for_every_variant() {
        let variants = [
            Errno::EAgain,
            Errno::EBadf,
            Errno::EBusy,
            Errno::EConnRefused,
            Errno::EConnReset,
            Errno::EDestAddrReq,
            Errno::EExist,
            Errno::EFault,
            Errno::EIntr,
            Errno::EIsConn,
            Errno::EIsDir,
            Errno::EInval,
            Errno::EIo,
            Errno::ELoop,
            Errno::EMsgSize,
            Errno::ENetUnreach,
            Errno::ENameTooLong,
            Errno::ENoDev,
            Errno::ENoBufs,
            Errno::ENoEnt,
            Errno::ENoMem,
            Errno::ENoSys,
            Errno::ENotConn,
            Errno::ENotDir,
            Errno::ENotSock,
            Errno::EPerm,
            Errno::EPipe,
            Errno::EProtoNoSupport,
            Errno::EProtoType,
            Errno::ERange,
            Errno::ETimedOut,
            Errno::EWouldBlock,
            Errno::EXDev,
        ];
        for e in variants {
            assert!(!e.name().is_empty());
        }
    }

    #[test]
    fn agagain_and_ewouldblock_share_a_value() {
        assert_eq!(Errno::EAgain.code(), Errno::EWouldBlock.code());
    }
}
