//! UDP flow building: each datagram becomes its own `Connection` (spec.md
//! §4.3), no reassembly state is kept across datagrams.

use chrono::{DateTime, Utc};
use sentry_common::{AtomicCounter, FlowKey};
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionPool, TransportType};

/// One decoded UDP datagram handed to the builder by the capture/decode stage.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    /// Directional flow the datagram belongs to.
    pub flow: FlowKey,
    /// Datagram payload.
    pub payload: Vec<u8>,
    /// Capture timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Builds one `Connection` per UDP datagram and forwards it on the shared
/// output channel, non-blocking: a full channel drops the datagram and
/// counts it (spec.md §4.11).
pub struct UdpFlowBuilder {
    output_tx: mpsc::Sender<Connection>,
    connection_pool: ConnectionPool,
    dropped: AtomicCounter,
}

impl UdpFlowBuilder {
    /// Build a flow builder sharing the reassembler's output channel and
    /// connection pool.
    pub fn new(output_tx: mpsc::Sender<Connection>, connection_pool: ConnectionPool) -> Self {
        Self { output_tx, connection_pool, dropped: AtomicCounter::default() }
    }

    /// Turn one datagram into a Connection and try to enqueue it.
    pub fn build(&self, datagram: UdpDatagram) {
        if datagram.payload.is_empty() {
            return;
        }

        let mut conn = self.connection_pool.get();
        conn.timestamp = datagram.timestamp;
        conn.uid = datagram.flow.fast_hash();
        conn.source_ip = datagram.flow.src_ip.to_string();
        conn.source_port = datagram.flow.src_port;
        conn.destination_ip = datagram.flow.dst_ip.to_string();
        conn.destination_port = datagram.flow.dst_port;
        conn.transport_type = TransportType::Udp;
        conn.duration = 0.0;
        conn.payload = datagram.payload;

        if self.output_tx.try_send(conn).is_err() {
            self.dropped.inc();
            tracing::warn!("reassembled-connection queue full, dropping UDP datagram");
        }
    }

    /// Count of datagrams dropped because the output queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn flow() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            51000,
            53,
            17,
        )
    }

    #[tokio::test]
    async fn datagram_becomes_one_connection() {
        let (tx, mut rx) = mpsc::channel(4);
        let builder = UdpFlowBuilder::new(tx, ConnectionPool::new(4));

        builder.build(UdpDatagram { flow: flow(), payload: b"\x00\x01query".to_vec(), timestamp: Utc::now() });

        let conn = rx.recv().await.expect("connection emitted");
        assert_eq!(conn.transport_type, TransportType::Udp);
        assert_eq!(conn.destination_port, 53);
        assert_eq!(conn.payload, b"\x00\x01query");
    }

    #[tokio::test]
    async fn empty_datagram_is_discarded() {
        let (tx, mut rx) = mpsc::channel(4);
        let builder = UdpFlowBuilder::new(tx, ConnectionPool::new(4));
        builder.build(UdpDatagram { flow: flow(), payload: Vec::new(), timestamp: Utc::now() });
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_and_counts() {
        let (tx, _rx) = mpsc::channel(1);
        let builder = UdpFlowBuilder::new(tx.clone(), ConnectionPool::new(4));
        builder.build(UdpDatagram { flow: flow(), payload: b"a".to_vec(), timestamp: Utc::now() });
        builder.build(UdpDatagram { flow: flow(), payload: b"b".to_vec(), timestamp: Utc::now() });
        assert_eq!(builder.dropped(), 1);
    }
}
