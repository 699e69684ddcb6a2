//! ARP request/reply handling and the resolve-with-timeout used by
//! [`crate::ipv4::route`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use kcore::errno::Errno;
use ksched::event::event_await;
use ksched::timer::TIMERS;

use crate::adapter::Adapter;
use crate::types::{Ipv4Addr, MacAddr};

const HW_ETHERNET: u16 = 1;
const PROTO_IPV4: u16 = 0x0800;
const OP_REQUEST: u16 = 1;
const OP_REPLY: u16 = 2;
const PACKET_LEN: usize = 28;

const POLL_INTERVAL_MS: u64 = 10;
const TIMEOUT_MS: u64 = 500;

fn build(op: u16, adapter_mac: MacAddr, adapter_ip: Ipv4Addr, target_mac: MacAddr, target_ip: Ipv4Addr) -> [u8; PACKET_LEN] {
    let mut pkt = [0u8; PACKET_LEN];
    pkt[0..2].copy_from_slice(&HW_ETHERNET.to_be_bytes());
    pkt[2..4].copy_from_slice(&PROTO_IPV4.to_be_bytes());
    pkt[4] = 6;
    pkt[5] = 4;
    pkt[6..8].copy_from_slice(&op.to_be_bytes());
    pkt[8..14].copy_from_slice(&adapter_mac.0);
    pkt[14..18].copy_from_slice(&adapter_ip.0);
    pkt[18..24].copy_from_slice(&target_mac.0);
    pkt[24..28].copy_from_slice(&target_ip.0);
    pkt
}

/// Sends an ARP request (opcode 1) broadcast for `target_ip` on `adapter`.
pub fn send_request(adapter: &Adapter, target_ip: Ipv4Addr) {
    let cfg = adapter.config();
    let pkt = build(OP_REQUEST, cfg.mac, cfg.ip, MacAddr::ZERO, target_ip);
    crate::ethernet::send_frame(adapter, MacAddr::BROADCAST, crate::ethernet::ETHERTYPE_ARP, &pkt);
}

fn send_reply(adapter: &Adapter, requester_mac: MacAddr, requester_ip: Ipv4Addr) {
    let cfg = adapter.config();
    let pkt = build(OP_REPLY, cfg.mac, cfg.ip, requester_mac, requester_ip);
    crate::ethernet::send_frame(adapter, requester_mac, crate::ethernet::ETHERTYPE_ARP, &pkt);
}

/// Handles an inbound ARP payload (the Ethernet payload, `payload.len() ==
/// 28`): replies to requests for our address, always caches the sender.
pub fn handle(adapter: &Adapter, payload: &[u8]) {
    if payload.len() < PACKET_LEN {
        return;
    }
    let hw_type = u16::from_be_bytes([payload[0], payload[1]]);
    let proto = u16::from_be_bytes([payload[2], payload[3]]);
    if hw_type != HW_ETHERNET || proto != PROTO_IPV4 {
        return;
    }
    let op = u16::from_be_bytes([payload[6], payload[7]]);
    let sender_mac = MacAddr([payload[8], payload[9], payload[10], payload[11], payload[12], payload[13]]);
    let sender_ip = Ipv4Addr([payload[14], payload[15], payload[16], payload[17]]);
    let target_ip = Ipv4Addr([payload[24], payload[25], payload[26], payload[27]]);

    adapter.arp_insert(sender_ip, sender_mac, TIMERS.monotonic_ms());

    if op == OP_REQUEST && target_ip == adapter.config().ip {
        send_reply(adapter, sender_mac, sender_ip);
    }
}

/// Resolves `ip` to a hardware address: the loopback and local-adapter
/// shortcuts, then the cache, then an ARP request polled every 10ms for up
/// to 500ms before giving up with `ENETUNREACH`.
pub fn lookup(adapter: &Arc<Adapter>, ip: Ipv4Addr) -> Result<MacAddr, Errno> {
    if ip == Ipv4Addr::LOOPBACK {
        return Ok(MacAddr::ZERO);
    }
    if let Some(found) = crate::adapter::find_by_ip(ip) {
        return Ok(found.config().mac);
    }
    if let Some(mac) = adapter.arp_lookup_cached(ip) {
        return Ok(mac);
    }

    send_request(adapter, ip);

    let timer_event = Arc::new(ksched::event::Event::new());
    let mut elapsed = 0u64;
    while elapsed < TIMEOUT_MS {
        let handle = TIMERS.arm(POLL_INTERVAL_MS, timer_event.clone());
        event_await(&[&timer_event], true);
        TIMERS.disarm(handle);
        elapsed += POLL_INTERVAL_MS;

        if let Some(mac) = adapter.arp_lookup_cached(ip) {
            return Ok(mac);
        }
    }
    Err(Errno::ENetUnreach)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_reply_round_trip_through_bytes() {
        let req = build(OP_REQUEST, MacAddr([1, 2, 3, 4, 5, 6]), Ipv4Addr::new(10, 0, 0, 1), MacAddr::ZERO, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(u16::from_be_bytes([req[6], req[7]]), OP_REQUEST);
        assert_eq!(&req[8..14], &[1, 2, 3, 4, 5, 6]);
    }
}
