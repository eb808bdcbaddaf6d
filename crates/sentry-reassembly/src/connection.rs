//! The `Connection` aggregate: the central per-flow record that analyzers
//! populate and the persister/agent ship onward.

use std::collections::HashMap;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use sentry_common::{Pool, Resettable};
use serde::{Deserialize, Serialize};

/// Transport protocol a Connection was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Reassembled TCP stream.
    Tcp,
    /// Single UDP datagram.
    Udp,
}

/// The central per-flow aggregate (spec.md §3). Once placed on the worker
/// queue it is append-only from the analyzer side; the payload buffer is
/// owned exclusively by this Connection until it is returned to the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Timestamp of the first observed packet, RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// 64-bit flow identifier combining network- and transport-flow hashes.
    pub uid: u64,
    /// Source address, stringified.
    pub source_ip: String,
    /// Source port.
    pub source_port: u16,
    /// Destination address, stringified.
    pub destination_ip: String,
    /// Destination port.
    pub destination_port: u16,
    /// `"tcp"` or `"udp"`.
    pub transport_type: TransportType,
    /// Observed duration in seconds; max `packet_ts - start_ts` over the
    /// stream's life.
    pub duration: f64,
    /// Textual TCP FSM state; empty for UDP.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub state: String,
    /// Reassembled payload bytes.
    #[serde(skip)]
    pub payload: Vec<u8>,
    /// Analyzer results keyed by tag (`content`, `tls`, `http`, `http2`, `dns`).
    #[serde(default)]
    pub analyzers: HashMap<String, serde_json::Value>,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            uid: 0,
            source_ip: String::new(),
            source_port: 0,
            destination_ip: String::new(),
            destination_port: 0,
            transport_type: TransportType::Tcp,
            duration: 0.0,
            state: String::new(),
            payload: Vec::new(),
            analyzers: HashMap::new(),
        }
    }
}

impl Connection {
    /// Insert an analyzer result under its key, serializing it first.
    pub fn set_analyzer<T: Serialize>(&mut self, key: &str, value: &T) {
        if let Ok(json) = serde_json::to_value(value) {
            self.analyzers.insert(key.to_string(), json);
        }
    }

    /// True if `ip`/`port` matches either side of the connection.
    pub fn touches(&self, ip: &IpAddr, port: u16) -> bool {
        let ip = ip.to_string();
        (self.source_ip == ip && self.source_port == port)
            || (self.destination_ip == ip && self.destination_port == port)
    }
}

impl Resettable for Connection {
    fn reset(&mut self) {
        self.timestamp = Utc::now();
        self.uid = 0;
        self.source_ip.clear();
        self.source_port = 0;
        self.destination_ip.clear();
        self.destination_port = 0;
        self.transport_type = TransportType::Tcp;
        self.duration = 0.0;
        self.state.clear();
        self.payload.clear();
        self.analyzers.clear();
    }
}

/// Pool of reusable `Connection` records (spec.md §4.3, §9 "shared payload
/// ownership"): fields are reset on `get()`, guaranteeing no cross-flow
/// contamination.
pub type ConnectionPool = Pool<Connection>;

/// A pooled, reset-on-reuse payload buffer. The TCP reassembler and UDP
/// builder acquire one per stream/datagram; its bytes move into a
/// `Connection` on completion and the (now-empty) buffer returns to this
/// pool only once the persister releases the connection (spec.md §4.2).
#[derive(Debug, Default)]
pub struct PayloadBuffer(pub Vec<u8>);

impl Resettable for PayloadBuffer {
    fn reset(&mut self) {
        self.0.clear();
    }
}

impl Deref for PayloadBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

impl DerefMut for PayloadBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.0
    }
}

/// Pool of reusable payload buffers, shared by the TCP reassembler and the
/// UDP flow builder.
pub type PayloadPool = Pool<PayloadBuffer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_get_resets_fields() {
        let pool = ConnectionPool::new(4);
        let mut conn = pool.get();
        conn.source_ip = "10.0.0.1".into();
        conn.payload.extend_from_slice(b"hello");
        conn.set_analyzer("content", &serde_json::json!({"a": 1}));
        pool.put(conn);

        let fresh = pool.get();
        assert!(fresh.source_ip.is_empty());
        assert!(fresh.payload.is_empty());
        assert!(fresh.analyzers.is_empty());
    }

    #[test]
    fn touches_matches_either_side() {
        let mut conn = Connection::default();
        conn.source_ip = "1.2.3.4".into();
        conn.source_port = 5555;
        conn.destination_ip = "9.9.9.9".into();
        conn.destination_port = 443;

        assert!(conn.touches(&"9.9.9.9".parse().unwrap(), 443));
        assert!(conn.touches(&"1.2.3.4".parse().unwrap(), 5555));
        assert!(!conn.touches(&"9.9.9.9".parse().unwrap(), 80));
    }
}
