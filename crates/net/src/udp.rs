//! UDP sockets: per-port bind table, connectionless send/recv, and the
//! inbound handler that demuxes on destination port.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::sync::SpinLock;
use ksched::event::{event_await, event_trigger, Event};

use crate::adapter::Adapter;
use crate::checksum::pseudo_header_checksum;
use crate::ipv4::{Ipv4Packet, PROTO_UDP};
use crate::socket::{is_nonblocking, MsgFlags, PollFlags, SocketFlags};
use crate::types::Ipv4Addr;

const HEADER_LEN: usize = 8;
const MAX_QUEUE_LEN: usize = 128;

/// One datagram sitting in a socket's receive queue.
pub struct UdpDatagram {
    /// Sender's IPv4 address.
    pub src_ip: Ipv4Addr,
    /// Sender's UDP port.
    pub src_port: u16,
    /// Payload.
    pub data: Vec<u8>,
}

struct UdpSocketState {
    recv_queue: VecDeque<UdpDatagram>,
    peer: Option<(Ipv4Addr, u16)>,
    flags: SocketFlags,
}

/// A bound UDP endpoint.
pub struct UdpSocket {
    adapter: Arc<Adapter>,
    local_ip: Ipv4Addr,
    port: u16,
    state: SpinLock<UdpSocketState>,
    event: Event,
}

static BOUND: SpinLock<BTreeMap<u16, Arc<UdpSocket>>> = SpinLock::new(BTreeMap::new());

impl UdpSocket {
    /// Binds a new UDP socket to `requested_port` (or a random ephemeral
    /// port if 0) on `adapter`.
    pub fn bind(adapter: Arc<Adapter>, requested_port: u16) -> Result<Arc<Self>, Errno> {
        let port = if requested_port == 0 {
            crate::port::alloc_port()?
        } else if crate::port::claim(requested_port) {
            requested_port
        } else {
            return Err(Errno::EInval);
        };

        let local_ip = adapter.config().ip;
        let socket = Arc::new(Self {
            adapter,
            local_ip,
            port,
            state: SpinLock::new(UdpSocketState {
                recv_queue: VecDeque::new(),
                peer: None,
                flags: SocketFlags::empty(),
            }),
            event: Event::new(),
        });
        BOUND.lock().insert(port, socket.clone());
        Ok(socket)
    }

    /// Records the peer address for subsequent unaddressed `sendmsg`s and
    /// marks the socket connected with `POLLIN|POLLOUT` readiness.
    pub fn connect(&self, peer_ip: Ipv4Addr, peer_port: u16) {
        let mut state = self.state.lock();
        state.peer = Some((peer_ip, peer_port));
        state.flags.insert(SocketFlags::CONNECTED);
    }

    /// Sets `SO_BROADCAST`.
    pub fn set_broadcast(&self, enabled: bool) {
        let mut state = self.state.lock();
        state.flags.set(SocketFlags::BROADCAST, enabled);
    }

    /// Whether `SO_BROADCAST` is currently set.
    #[must_use]
    pub fn broadcast(&self) -> bool {
        self.state.lock().flags.contains(SocketFlags::BROADCAST)
    }

    /// The bound local `(address, port)`.
    #[must_use]
    pub fn local_addr(&self) -> (Ipv4Addr, u16) {
        (self.local_ip, self.port)
    }

    /// The address last given to `connect`, if any.
    pub fn peer_addr(&self) -> Result<(Ipv4Addr, u16), Errno> {
        self.state.lock().peer.ok_or(Errno::ENotConn)
    }

    /// Current readiness: `POLLIN` if data is queued, `POLLOUT` always (UDP
    /// send never blocks on buffer space).
    #[must_use]
    pub fn poll(&self) -> PollFlags {
        let state = self.state.lock();
        let mut flags = PollFlags::POLLOUT;
        if !state.recv_queue.is_empty() {
            flags |= PollFlags::POLLIN;
        }
        flags
    }

    /// Sends `data` to `dst`, or to the connected peer if `dst` is `None`.
    pub fn sendmsg(&self, dst: Option<(Ipv4Addr, u16)>, data: &[u8]) -> Result<usize, Errno> {
        let (dst_ip, dst_port) = dst.or_else(|| self.state.lock().peer).ok_or(Errno::EDestAddrReq)?;

        let is_broadcast = dst_ip == Ipv4Addr::BROADCAST || dst_ip.is_broadcast_for(self.adapter.config().mask);
        if is_broadcast && !self.state.lock().flags.contains(SocketFlags::BROADCAST) {
            return Err(Errno::EPerm);
        }

        let total_len = HEADER_LEN + data.len();
        let mut datagram = alloc::vec![0u8; total_len];
        datagram[0..2].copy_from_slice(&self.port.to_be_bytes());
        datagram[2..4].copy_from_slice(&dst_port.to_be_bytes());
        datagram[4..6].copy_from_slice(&(total_len as u16).to_be_bytes());
        datagram[8..].copy_from_slice(data);

        let csum = pseudo_header_checksum(self.local_ip, dst_ip, PROTO_UDP, &datagram);
        datagram[6..8].copy_from_slice(&csum.to_be_bytes());

        crate::ipv4::send_inet(&self.adapter, self.local_ip, dst_ip, PROTO_UDP, &datagram)?;
        Ok(data.len())
    }

    /// Dequeues one datagram, copying its payload into the start of `buf`
    /// and returning `(bytes_copied, src_ip, src_port)`. Blocks on the
    /// socket's event unless non-blocking.
    pub fn recv(&self, buf: &mut [u8], msg_flags: MsgFlags) -> Result<(usize, Ipv4Addr, u16), Errno> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(dgram) = state.recv_queue.pop_front() {
                    let n = dgram.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&dgram.data[..n]);
                    return Ok((n, dgram.src_ip, dgram.src_port));
                }
                if is_nonblocking(state.flags, msg_flags) {
                    return Err(Errno::EAgain);
                }
            }
            event_await(&[&self.event], true);
        }
    }

    fn deliver(&self, dgram: UdpDatagram) {
        let mut state = self.state.lock();
        if state.recv_queue.len() < MAX_QUEUE_LEN {
            state.recv_queue.push_back(dgram);
        }
        drop(state);
        event_trigger(&self.event, false);
    }
}

impl crate::socket::Socket for UdpSocket {
    fn poll(&self) -> PollFlags {
        UdpSocket::poll(self)
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        BOUND.lock().remove(&self.port);
        crate::port::release(self.port);
    }
}

/// Looks up the socket bound to `port`, if any.
#[must_use]
pub fn find(port: u16) -> Option<Arc<UdpSocket>> {
    BOUND.lock().get(&port).cloned()
}

/// Handles an inbound UDP segment: validates length, locates the socket
/// bound to the destination port, enqueues the datagram. On no match,
/// replies with ICMP destination/port-unreachable.
pub fn udp_on_udp(adapter: &Arc<Adapter>, pkt: &Ipv4Packet<'_>) {
    let data = pkt.payload;
    if data.len() < HEADER_LEN {
        return;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    if length > data.len() || length < HEADER_LEN {
        return;
    }
    let csum_field = u16::from_be_bytes([data[6], data[7]]);
    if csum_field != 0 {
        let csum = pseudo_header_checksum(pkt.src, pkt.dst, PROTO_UDP, &data[..length]);
        if csum != 0 {
            return;
        }
    }

    let payload = data[HEADER_LEN..length].to_vec();

    match find(dst_port) {
        Some(socket) => socket.deliver(UdpDatagram {
            src_ip: pkt.src,
            src_port,
            data: payload,
        }),
        None => send_port_unreachable(adapter, pkt, data),
    }
}

fn send_port_unreachable(adapter: &Arc<Adapter>, pkt: &Ipv4Packet<'_>, original: &[u8]) {
    const DEST_UNREACHABLE: u8 = 3;
    const PORT_UNREACHABLE: u8 = 3;
    let include = original.len().min(28);
    let mut icmp = alloc::vec![0u8; 8 + include];
    icmp[0] = DEST_UNREACHABLE;
    icmp[1] = PORT_UNREACHABLE;
    icmp[8..].copy_from_slice(&original[..include]);
    let csum = crate::checksum::internet_checksum(&icmp, 0);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    let _ = crate::ipv4::send_inet(adapter, pkt.dst, pkt.src, crate::ipv4::PROTO_ICMP, &icmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_round_trip() {
        let mut datagram = alloc::vec![0u8; HEADER_LEN + 4];
        datagram[0..2].copy_from_slice(&1234u16.to_be_bytes());
        datagram[2..4].copy_from_slice(&80u16.to_be_bytes());
        assert_eq!(u16::from_be_bytes([datagram[0], datagram[1]]), 1234);
        assert_eq!(u16::from_be_bytes([datagram[2], datagram[3]]), 80);
    }
}
