//! IPv4 core: header build/parse, routing, checksum validation, and the
//! per-adapter inbound demultiplex loop.

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use kcore::klog_target;

use crate::adapter::Adapter;
use crate::checksum::internet_checksum;
use crate::types::{Ipv4Addr, MacAddr};

/// Protocol number for ICMP.
pub const PROTO_ICMP: u8 = 1;
/// Protocol number for TCP.
pub const PROTO_TCP: u8 = 6;
/// Protocol number for UDP.
pub const PROTO_UDP: u8 = 17;

const HEADER_LEN: usize = 20;

/// A parsed IPv4 packet, borrowing its payload from the original buffer.
pub struct Ipv4Packet<'a> {
    /// Source address.
    pub src: Ipv4Addr,
    /// Destination address.
    pub dst: Ipv4Addr,
    /// `protocol` field (ICMP/TCP/UDP).
    pub protocol: u8,
    /// Time-to-live as received.
    pub ttl: u8,
    /// Bytes after the header, truncated to `total_len`.
    pub payload: &'a [u8],
}

/// Parses `data` as an IPv4 datagram: validates version, header length, and
/// header checksum. `None` on any failure.
#[must_use]
pub fn parse(data: &[u8]) -> Option<Ipv4Packet<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    if data[0] >> 4 != 4 {
        return None;
    }
    let ihl = (data[0] & 0x0F) as usize;
    let header_len = ihl * 4;
    if header_len < HEADER_LEN || data.len() < header_len {
        return None;
    }
    if internet_checksum(&data[..header_len], 0) != 0 {
        return None;
    }
    let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if total_len > data.len() || total_len < header_len {
        return None;
    }
    let ttl = data[8];
    let protocol = data[9];
    let src = Ipv4Addr([data[12], data[13], data[14], data[15]]);
    let dst = Ipv4Addr([data[16], data[17], data[18], data[19]]);
    Some(Ipv4Packet {
        src,
        dst,
        protocol,
        ttl,
        payload: &data[header_len..total_len],
    })
}

/// Resolves the hardware destination for a datagram bound for `remote` on
/// `adapter`: broadcasts resolve to the broadcast MAC directly; an on-subnet
/// remote is ARPed directly, an off-subnet remote is ARPed via the gateway.
/// If `adapter` is `None`, every registered adapter is tried, preferring an
/// on-subnet match, falling back to one with a configured gateway.
pub fn route(adapter: Option<&Arc<Adapter>>, local: Ipv4Addr, remote: Ipv4Addr) -> Result<(Arc<Adapter>, MacAddr), Errno> {
    if remote == Ipv4Addr::BROADCAST || remote.is_broadcast_for(adapter.map_or(Ipv4Addr::ANY, |a| a.config().mask)) {
        let chosen = match adapter {
            Some(a) => a.clone(),
            None => crate::adapter::all().into_iter().next().ok_or(Errno::ENetUnreach)?,
        };
        return Ok((chosen, MacAddr::BROADCAST));
    }

    if let Some(a) = adapter {
        let cfg = a.config();
        if cfg.ip != local {
            return Err(Errno::ENetUnreach);
        }
        let next_hop = if cfg.is_local(remote) { remote } else { cfg.gateway };
        let mac = crate::arp::lookup(a, next_hop)?;
        return Ok((a.clone(), mac));
    }

    let adapters = crate::adapter::all();
    let on_subnet = adapters.iter().find(|a| a.config().is_local(remote));
    let chosen = on_subnet
        .or_else(|| adapters.iter().find(|a| a.config().gateway != Ipv4Addr::ANY))
        .ok_or(Errno::ENetUnreach)?;
    let cfg = chosen.config();
    let next_hop = if cfg.is_local(remote) { remote } else { cfg.gateway };
    let mac = crate::arp::lookup(chosen, next_hop)?;
    Ok((chosen.clone(), mac))
}

/// Builds and transmits an IPv4 datagram: Ethernet + IPv4 header + `data`.
pub fn send_inet(adapter: &Arc<Adapter>, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, data: &[u8]) -> Result<(), Errno> {
    let dst_mac = if dst == Ipv4Addr::BROADCAST {
        MacAddr::BROADCAST
    } else {
        let (_, mac) = route(Some(adapter), src, dst)?;
        mac
    };

    let total_len = HEADER_LEN + data.len();
    let mut header = [0u8; HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    header[4..6].copy_from_slice(&adapter.next_ipframe_id().to_be_bytes());
    header[6] = 0x40;
    header[8] = 64;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.0);
    header[16..20].copy_from_slice(&dst.0);
    let csum = internet_checksum(&header, 0);
    header[10..12].copy_from_slice(&csum.to_be_bytes());

    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(data);

    crate::ethernet::send_frame(adapter, dst_mac, crate::ethernet::ETHERTYPE_IPV4, &frame);
    Ok(())
}

/// Handles an inbound IPv4 datagram (already checksum-validated by `parse`),
/// dispatching to ICMP echo, TCP, or UDP by `protocol`.
pub fn handle(adapter: &Arc<Adapter>, data: &[u8]) {
    let Some(pkt) = parse(data) else {
        return;
    };
    match pkt.protocol {
        PROTO_ICMP => handle_icmp(adapter, &pkt),
        PROTO_TCP => crate::tcp::tcp_on_tcp(adapter, &pkt),
        PROTO_UDP => crate::udp::udp_on_udp(adapter, &pkt),
        _ => {}
    }
}

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

fn handle_icmp(adapter: &Arc<Adapter>, pkt: &Ipv4Packet<'_>) {
    if pkt.payload.len() < 8 || pkt.payload[0] != ICMP_ECHO_REQUEST {
        return;
    }
    let mut reply = pkt.payload.to_vec();
    reply[0] = ICMP_ECHO_REPLY;
    reply[2] = 0;
    reply[3] = 0;
    let csum = internet_checksum(&reply, 0);
    reply[2..4].copy_from_slice(&csum.to_be_bytes());
    let _ = send_inet(adapter, adapter.config().ip, pkt.src, PROTO_ICMP, &reply);
}

/// Runs the inbound demultiplex loop for `adapter`: awaits the arrival
/// event, pops the oldest frame, and dispatches it through Ethernet. Never
/// returns; intended to be run as the adapter's dedicated kernel thread.
pub fn demux_loop(adapter: Arc<Adapter>) -> ! {
    loop {
        loop {
            let Some(frame) = adapter.dequeue_rx() else {
                break;
            };
            crate::ethernet::handle_frame(&adapter, &frame);
        }
        ksched::event::event_await(&[&adapter.rx_event], true);
        klog_target!(kcore::log::LogLevel::Trace, "net", "adapter woke for inbound frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_bad_checksum() {
        let mut data = [0u8; 20];
        data[0] = 0x45;
        data[2..4].copy_from_slice(&20u16.to_be_bytes());
        data[9] = PROTO_UDP;
        assert!(parse(&data).is_none());
    }

    #[test]
    fn parse_accepts_valid_header() {
        let mut data = [0u8; 20];
        data[0] = 0x45;
        data[2..4].copy_from_slice(&20u16.to_be_bytes());
        data[9] = PROTO_UDP;
        data[12..16].copy_from_slice(&[10, 0, 0, 1]);
        data[16..20].copy_from_slice(&[10, 0, 0, 2]);
        let csum = internet_checksum(&data, 0);
        data[10..12].copy_from_slice(&csum.to_be_bytes());
        let pkt = parse(&data).unwrap();
        assert_eq!(pkt.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(pkt.protocol, PROTO_UDP);
    }
}
