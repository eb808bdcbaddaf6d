//! 5-tuple flow identity and hashing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A 5-tuple flow key: protocol, source/destination address and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source address.
    pub src_ip: IpAddr,
    /// Destination address.
    pub dst_ip: IpAddr,
    /// Source port (0 for protocols without ports).
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// IP protocol number (6 = TCP, 17 = UDP).
    pub protocol: u8,
}

impl FlowKey {
    /// Build a flow key from already-decoded fields.
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self { src_ip, dst_ip, src_port, dst_port, protocol }
    }

    /// Swap source and destination to look up the reverse direction of a flow.
    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Stable 64-bit hash combining the network and transport flow. Used as
    /// the Connection UID, mirroring the source's `net.FastHash() + transport.FastHash()`.
    pub fn fast_hash(&self) -> u64 {
        const K: u64 = 0x517c_c1b7_2722_0a95;
        let mut h: u64 = 0;
        h = h.wrapping_add(ip_to_u64(self.src_ip).wrapping_mul(K));
        h = h.rotate_left(31);
        h = h.wrapping_add(ip_to_u64(self.dst_ip).wrapping_mul(K));
        h = h.rotate_left(31);
        h = h.wrapping_add(
            (((self.src_port as u64) << 48) | ((self.dst_port as u64) << 32) | self.protocol as u64)
                .wrapping_mul(K),
        );
        h
    }
}

fn ip_to_u64(ip: IpAddr) -> u64 {
    match ip {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()) as u64,
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            u64::from_be_bytes(octets[8..16].try_into().unwrap())
        }
    }
}

/// TCP connection FSM state, tracked from observed flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    /// No flags observed that would advance the FSM yet.
    #[default]
    New,
    /// SYN seen, no SYN-ACK yet.
    SynSent,
    /// SYN-ACK seen.
    SynReceived,
    /// Three-way handshake complete.
    Established,
    /// FIN observed from either side.
    FinWait,
    /// RST observed, or idle-timeout flush.
    Closed,
}

impl TcpState {
    /// Textual state name, copied verbatim into the Connection record.
    pub fn as_str(&self) -> &'static str {
        match self {
            TcpState::New => "NEW",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait => "FIN_WAIT",
            TcpState::Closed => "CLOSED",
        }
    }

    /// Advance the FSM from a single packet's flag bits.
    /// `syn`, `ack`, `fin`, `rst` are the usual TCP header flags.
    pub fn advance(&mut self, syn: bool, ack: bool, fin: bool, rst: bool) {
        if rst {
            *self = TcpState::Closed;
            return;
        }
        *self = match (*self, syn, ack, fin) {
            (_, true, false, _) => TcpState::SynSent,
            (TcpState::SynSent, true, true, _) | (_, true, true, _) => TcpState::SynReceived,
            (_, _, _, true) => TcpState::FinWait,
            (TcpState::SynReceived, false, true, false) => TcpState::Established,
            (state, ..) => state,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_direction_sensitive() {
        let fwd = FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            12345,
            443,
            6,
        );
        let fwd2 = fwd;
        assert_eq!(fwd.fast_hash(), fwd2.fast_hash());
        assert_ne!(fwd.fast_hash(), fwd.reverse().fast_hash());
    }

    #[test]
    fn ipv6_hash_does_not_panic() {
        let key = FlowKey::new(
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            53,
            53,
            17,
        );
        assert_ne!(key.fast_hash(), 0);
    }

    #[test]
    fn fsm_handshake_then_close() {
        let mut state = TcpState::default();
        state.advance(true, false, false, false);
        assert_eq!(state, TcpState::SynSent);
        state.advance(true, true, false, false);
        assert_eq!(state, TcpState::SynReceived);
        state.advance(false, true, false, false);
        assert_eq!(state, TcpState::Established);
        state.advance(false, true, true, false);
        assert_eq!(state, TcpState::FinWait);
    }

    #[test]
    fn rst_always_closes() {
        let mut state = TcpState::Established;
        state.advance(false, false, false, true);
        assert_eq!(state, TcpState::Closed);
    }
}
