//! The per-process descriptor space: files and sockets share one
//! small-integer numbering, the way a real `dup`/`close`/`select` surface
//! needs them to.
//!
//! [`kfs::FdTable`] only tracks [`OpenFileDescription`]s; sockets (UDP,
//! TCP, UNIX-domain) have no VFS node to hang one off. Rather than force a
//! socket through `Resource`'s file-shaped `read`/`write`/`stat` contract,
//! this table generalizes `kfs::fd`'s smallest-free-slot scheme over
//! either kind.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use kfs::OpenFileDescription;
use knet::{TcpSocket, UdpSocket, UnixSocket};

/// One open descriptor: a VFS-backed file, or a socket of one of the three
/// kinds this kernel implements.
#[derive(Clone)]
pub enum Descriptor {
    /// A regular `openat`-opened file or device.
    File(Arc<OpenFileDescription>),
    /// A UDP datagram socket.
    Udp(Arc<UdpSocket>),
    /// A TCP stream socket.
    Tcp(Arc<TcpSocket>),
    /// A UNIX-domain stream socket.
    Unix(Arc<UnixSocket>),
}

/// A process's fd-number table, shared by every thread in the group.
pub struct FdSpace {
    slots: SpinLock<Vec<Option<Descriptor>>>,
}

impl FdSpace {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self { slots: SpinLock::new(Vec::new()) }
    }

    /// Inserts `descriptor` into the smallest free slot, returning the
    /// assigned fd number.
    pub fn insert(&self, descriptor: Descriptor) -> i32 {
        let mut slots = self.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(descriptor);
                return i as i32;
            }
        }
        slots.push(Some(descriptor));
        (slots.len() - 1) as i32
    }

    /// Returns the descriptor at `fd`, if open.
    pub fn get(&self, fd: i32) -> Result<Descriptor, Errno> {
        if fd < 0 {
            return Err(Errno::EBadf);
        }
        self.slots
            .lock()
            .get(fd as usize)
            .and_then(|s| s.clone())
            .ok_or(Errno::EBadf)
    }

    /// Closes `fd`, freeing its slot. Dropping the last `Arc` to a socket
    /// or description triggers that object's own `Drop` cleanup.
    pub fn close(&self, fd: i32) -> Result<(), Errno> {
        if fd < 0 {
            return Err(Errno::EBadf);
        }
        let mut slots = self.slots.lock();
        match slots.get_mut(fd as usize) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(Errno::EBadf),
        }
    }

    /// Returns a fresh table sharing every descriptor with this one
    /// (`fork` semantics).
    #[must_use]
    pub fn fork(&self) -> Self {
        let cloned = self.slots.lock().clone();
        Self { slots: SpinLock::new(cloned) }
    }
}

impl Default for FdSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_reuses_closed_slot() {
        let adapter = knet::adapter::register_loopback();
        let table = FdSpace::new();
        let a = table.insert(Descriptor::Udp(UdpSocket::bind(adapter, 0).unwrap()));
        table.close(a).unwrap();
        let b = table.insert(Descriptor::Unix(UnixSocket::create()));
        assert_eq!(a, b);
    }
}
