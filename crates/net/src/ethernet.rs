//! Ethernet framing: header build/parse and the dispatch from `handle_frame`
//! into ARP/IPv4.

use alloc::vec::Vec;

use crate::adapter::Adapter;
use crate::types::MacAddr;

/// EtherType for ARP frames.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// EtherType for IPv4 frames.
pub const ETHERTYPE_IPV4: u16 = 0x0800;

const HEADER_LEN: usize = 14;
const MIN_FRAME_LEN: usize = 60;

/// A parsed Ethernet frame, borrowing its payload from the original buffer.
pub struct EthFrame<'a> {
    /// Destination hardware address.
    pub dst: MacAddr,
    /// Source hardware address.
    pub src: MacAddr,
    /// EtherType field.
    pub ethertype: u16,
    /// Payload following the 14-byte header.
    pub payload: &'a [u8],
}

/// Parses `data` as an Ethernet frame, `None` if too short for a header.
#[must_use]
pub fn parse(data: &[u8]) -> Option<EthFrame<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let dst = MacAddr([data[0], data[1], data[2], data[3], data[4], data[5]]);
    let src = MacAddr([data[6], data[7], data[8], data[9], data[10], data[11]]);
    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    Some(EthFrame {
        dst,
        src,
        ethertype,
        payload: &data[HEADER_LEN..],
    })
}

/// Builds a frame, padding to the 60-byte Ethernet minimum (excluding FCS).
#[must_use]
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    while frame.len() < MIN_FRAME_LEN {
        frame.push(0);
    }
    frame
}

/// Builds and transmits a frame from `adapter`'s own MAC address.
pub fn send_frame(adapter: &Adapter, dst: MacAddr, ethertype: u16, payload: &[u8]) {
    let src = adapter.config().mac;
    let frame = build_frame(dst, src, ethertype, payload);
    adapter.txpacket(&frame);
}

/// Dispatches an inbound frame popped from `adapter`'s RX queue.
pub fn handle_frame(adapter: &Adapter, data: &[u8]) {
    let Some(frame) = parse(data) else {
        return;
    };
    match frame.ethertype {
        ETHERTYPE_ARP => crate::arp::handle(adapter, frame.payload),
        ETHERTYPE_IPV4 => crate::ipv4::handle(adapter, frame.payload),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_short_frames() {
        assert!(parse(&[0u8; 10]).is_none());
    }

    #[test]
    fn build_frame_pads_to_minimum() {
        let frame = build_frame(MacAddr::BROADCAST, MacAddr::ZERO, ETHERTYPE_ARP, &[1, 2, 3]);
        assert_eq!(frame.len(), MIN_FRAME_LEN);
    }

    #[test]
    fn round_trips_header_fields() {
        let frame = build_frame(MacAddr::BROADCAST, MacAddr([1, 2, 3, 4, 5, 6]), ETHERTYPE_IPV4, &[9, 9]);
        let parsed = parse(&frame).unwrap();
        assert_eq!(parsed.dst, MacAddr::BROADCAST);
        assert_eq!(parsed.src, MacAddr([1, 2, 3, 4, 5, 6]));
        assert_eq!(parsed.ethertype, ETHERTYPE_IPV4);
    }
}
