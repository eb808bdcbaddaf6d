//! Link/network/transport decode.
//!
//! The source hands every captured frame straight to `gopacket.NewPacket`
//! and lets that library walk the Ethernet/IP/TCP/UDP layers; there is no
//! hand-written decode to port from. This reads the headers directly —
//! Ethernet (with single-tag 802.1Q), IPv4/IPv6, then TCP/UDP — the same
//! manual big-endian field extraction the protocol analyzers use.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use sentry_common::FlowKey;
use sentry_reassembly::{TcpSegment, UdpDatagram};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_SYN: u8 = 0x02;
const TCP_FLAG_RST: u8 = 0x04;
const TCP_FLAG_ACK: u8 = 0x10;

/// A decoded transport-layer segment, ready for the reassembler or the UDP
/// flow builder.
pub enum Decoded {
    /// A TCP segment, handed to `TcpReassembler::assemble`.
    Tcp(TcpSegment),
    /// A single UDP datagram, handed to `UdpFlowBuilder::build`.
    Udp(UdpDatagram),
}

/// Decode one captured frame. Returns `None` for anything that isn't an
/// IPv4/IPv6-over-Ethernet TCP or UDP packet (ARP, non-IP ethertypes,
/// IP fragments without a reassembled transport header, and so on).
pub fn decode(frame: &[u8], timestamp: DateTime<Utc>) -> Option<Decoded> {
    let (ethertype, ip_start) = parse_ethernet(frame)?;

    let (src_ip, dst_ip, protocol, proto_start) = match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(&frame[ip_start..])?,
        ETHERTYPE_IPV6 => parse_ipv6(&frame[ip_start..])?,
        _ => return None,
    };
    let transport = &frame[ip_start + proto_start..];

    match protocol {
        PROTO_TCP => parse_tcp(transport, src_ip, dst_ip, timestamp).map(Decoded::Tcp),
        PROTO_UDP => parse_udp(transport, src_ip, dst_ip, timestamp).map(Decoded::Udp),
        _ => None,
    }
}

/// Returns `(ethertype, offset of the network-layer header)`.
fn parse_ethernet(frame: &[u8]) -> Option<(u16, usize)> {
    if frame.len() < 14 {
        return None;
    }
    let mut ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    let mut offset = 14;
    if ethertype == ETHERTYPE_VLAN {
        if frame.len() < offset + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([frame[offset + 2], frame[offset + 3]]);
        offset += 4;
    }
    Some((ethertype, offset))
}

/// Returns `(src, dst, protocol, offset of the transport header)`.
fn parse_ipv4(data: &[u8]) -> Option<(IpAddr, IpAddr, u8, usize)> {
    if data.len() < 20 {
        return None;
    }
    let ihl = (data[0] & 0x0F) as usize * 4;
    if ihl < 20 || data.len() < ihl {
        return None;
    }
    let protocol = data[9];
    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    Some((IpAddr::V4(src), IpAddr::V4(dst), protocol, ihl))
}

fn parse_ipv6(data: &[u8]) -> Option<(IpAddr, IpAddr, u8, usize)> {
    if data.len() < 40 {
        return None;
    }
    let next_header = data[6];
    let src: [u8; 16] = data[8..24].try_into().ok()?;
    let dst: [u8; 16] = data[24..40].try_into().ok()?;
    Some((IpAddr::V6(Ipv6Addr::from(src)), IpAddr::V6(Ipv6Addr::from(dst)), next_header, 40))
}

fn parse_tcp(data: &[u8], src_ip: IpAddr, dst_ip: IpAddr, timestamp: DateTime<Utc>) -> Option<TcpSegment> {
    if data.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let seq = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < 20 || data.len() < data_offset {
        return None;
    }
    let flags = data[13];
    let payload = data[data_offset..].to_vec();

    Some(TcpSegment {
        flow: FlowKey::new(src_ip, dst_ip, src_port, dst_port, PROTO_TCP),
        seq,
        syn: flags & TCP_FLAG_SYN != 0,
        ack: flags & TCP_FLAG_ACK != 0,
        fin: flags & TCP_FLAG_FIN != 0,
        rst: flags & TCP_FLAG_RST != 0,
        payload,
        timestamp,
    })
}

fn parse_udp(data: &[u8], src_ip: IpAddr, dst_ip: IpAddr, timestamp: DateTime<Utc>) -> Option<UdpDatagram> {
    if data.len() < 8 {
        return None;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    let payload = if length >= 8 && data.len() >= length { data[8..length].to_vec() } else { data[8..].to_vec() };

    Some(UdpDatagram {
        flow: FlowKey::new(src_ip, dst_ip, src_port, dst_port, PROTO_UDP),
        payload,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet_ipv4_tcp(payload: &[u8], flags: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 14]; // dst mac, src mac, ethertype
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45; // version 4, IHL 5
        ip[9] = PROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 2]);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[4..8].copy_from_slice(&100u32.to_be_bytes());
        tcp[12] = 5 << 4; // data offset 20 bytes
        tcp[13] = flags;

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&tcp);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn decodes_tcp_over_ipv4_ethernet() {
        let frame = ethernet_ipv4_tcp(b"hello", TCP_FLAG_SYN);
        match decode(&frame, Utc::now()) {
            Some(Decoded::Tcp(segment)) => {
                assert_eq!(segment.flow.src_port, 1234);
                assert_eq!(segment.flow.dst_port, 443);
                assert!(segment.syn);
                assert_eq!(segment.payload, b"hello");
            }
            _ => panic!("expected a decoded TCP segment"),
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(decode(&[0u8; 10], Utc::now()).is_none());
    }

    #[test]
    fn non_ip_ethertype_is_ignored() {
        let mut frame = vec![0u8; 18];
        frame[12..14].copy_from_slice(&0x0806u16.to_be_bytes()); // ARP
        assert!(decode(&frame, Utc::now()).is_none());
    }

    #[test]
    fn decodes_udp_datagram() {
        let mut frame = vec![0u8; 14];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = PROTO_UDP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[8, 8, 8, 8]);
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&5353u16.to_be_bytes());
        udp[2..4].copy_from_slice(&53u16.to_be_bytes());
        let total_len = 8u16 + 4;
        udp[4..6].copy_from_slice(&total_len.to_be_bytes());

        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&udp);
        frame.extend_from_slice(b"ping");

        match decode(&frame, Utc::now()) {
            Some(Decoded::Udp(datagram)) => {
                assert_eq!(datagram.flow.dst_port, 53);
                assert_eq!(datagram.payload, b"ping");
            }
            _ => panic!("expected a decoded UDP datagram"),
        }
    }
}
