//! Pluggable packet capture: a uniform `PacketDataSource`/`CaptureStrategy`
//! pair exposes pcap, AF_PACKET, PF_RING and eBPF/XDP sources behind one
//! interface, each reporting its own received/dropped counters.

#![warn(missing_docs)]

pub mod ebpf;
pub mod pcap_strategy;
pub mod pfring_strategy;
pub mod simulated;

use std::collections::HashMap;
use std::time::SystemTime;

use sentry_common::SentryError;

/// Capture metadata accompanying one packet read.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    /// Wall-clock time the packet was captured.
    pub timestamp: SystemTime,
    /// Number of bytes actually captured (may be less than `wire_len` if
    /// truncated by the snapshot length).
    pub capture_len: u32,
    /// Number of bytes the packet occupied on the wire.
    pub wire_len: u32,
}

/// A single opened packet source. Strategies may return more than one
/// (one per ring/cluster member).
pub trait PacketDataSource: Send {
    /// Copying read: returns owned bytes, capture metadata, or an error.
    fn read_packet_data(&mut self) -> Result<(Vec<u8>, CaptureInfo), SentryError>;

    /// Zero-copy read: the returned slice is only valid until the next call.
    /// Default implementation falls back to the copying path.
    fn zero_copy_read_packet_data(&mut self) -> Result<(Vec<u8>, CaptureInfo), SentryError> {
        self.read_packet_data()
    }
}

/// Shared configuration consumed by every strategy's `open`.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Network interface name.
    pub interface: String,
    /// Promiscuous mode on open.
    pub promiscuous: bool,
    /// Per-packet capture cap in bytes.
    pub snapshot_length: u32,
    /// Ring/cluster member count for strategies that support fanout.
    pub number_of_rings: usize,
    /// Optional BPF filter expression.
    pub bpf: Option<String>,
    /// Prefer a zero-copy read path when the strategy supports one.
    pub zero_copy: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            promiscuous: false,
            snapshot_length: 262_144,
            number_of_rings: 1,
            bpf: None,
            zero_copy: false,
        }
    }
}

/// Pluggable capture mechanism: open one or more packet sources, track
/// aggregate received/dropped counts, and release kernel resources on close.
pub trait CaptureStrategy: Send {
    /// Open the strategy against `config`, returning one source per ring.
    fn open(&mut self, config: &CaptureConfig) -> Result<Vec<Box<dyn PacketDataSource>>, SentryError>;

    /// Release all resources (sockets, maps, links) held by this strategy.
    fn close(&mut self);

    /// Aggregate (received, dropped) counters across every opened source.
    fn stats(&self) -> (u64, u64);
}

/// Strategy name → constructor. Unknown names are fatal at startup
/// (spec.md §4.1: "unknown name is fatal at startup").
pub struct StrategyRegistry {
    factories: HashMap<&'static str, fn() -> Box<dyn CaptureStrategy>>,
}

impl StrategyRegistry {
    /// Build the registry with the four built-in strategies.
    pub fn with_defaults() -> Self {
        let mut factories: HashMap<&'static str, fn() -> Box<dyn CaptureStrategy>> = HashMap::new();
        factories.insert("pcap", || Box::new(pcap_strategy::PcapStrategy::default()));
        factories.insert("afpacket", || Box::new(pcap_strategy::AfPacketStrategy::default()));
        factories.insert("pfring", || Box::new(pfring_strategy::PfRingStrategy::default()));
        factories.insert("ebpf", || Box::new(ebpf::EbpfStrategy::default()));
        Self { factories }
    }

    /// Instantiate the strategy registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn CaptureStrategy>, SentryError> {
        self.factories
            .get(name)
            .map(|f| f())
            .ok_or_else(|| SentryError::UnknownStrategy(name.to_string()))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_name_is_an_error() {
        let registry = StrategyRegistry::with_defaults();
        assert!(registry.create("carrier-pigeon").is_err());
    }

    #[test]
    fn known_strategies_construct() {
        let registry = StrategyRegistry::with_defaults();
        for name in ["pcap", "afpacket", "pfring", "ebpf"] {
            assert!(registry.create(name).is_ok(), "strategy {name} should construct");
        }
    }
}
