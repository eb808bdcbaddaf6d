//! TCP reassembly: turns a stream of decoded segments into completed
//! `Connection` records (spec.md §4.2).
//!
//! One `StreamState` is kept per undirected flow (both directions of a TCP
//! connection share a state machine and a payload buffer, the bytes
//! appended in the order segments are handed to [`TcpReassembler::assemble`]).
//! A background ticker flushes streams that have gone quiet longer than the
//! configured connection timeout.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sentry_common::{AtomicCounter, FlowKey, TcpState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionPool, PayloadBuffer, PayloadPool, TransportType};

/// Maximum out-of-order pages held across every stream before new
/// out-of-order segments are dropped rather than buffered.
const MAX_TOTAL_PAGES: usize = 100_000;

/// Maximum out-of-order pages held by a single stream before the oldest
/// (lowest sequence number) page is evicted to make room.
const MAX_PAGES_PER_STREAM: usize = 1_000;

/// One decoded TCP segment handed to the reassembler by the capture/decode
/// stage.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    /// Directional flow this segment belongs to.
    pub flow: FlowKey,
    /// TCP sequence number of the first payload byte.
    pub seq: u32,
    /// SYN flag.
    pub syn: bool,
    /// ACK flag.
    pub ack: bool,
    /// FIN flag.
    pub fin: bool,
    /// RST flag.
    pub rst: bool,
    /// Segment payload (may be empty for pure control segments).
    pub payload: Vec<u8>,
    /// Capture timestamp.
    pub timestamp: DateTime<Utc>,
}

struct StreamState {
    /// Flow as first observed; determines which side becomes `source_*`.
    flow: FlowKey,
    state: TcpState,
    payload: PayloadBuffer,
    packets: usize,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    next_seq: Option<u32>,
    out_of_order: BTreeMap<u32, Vec<u8>>,
}

impl StreamState {
    fn new(flow: FlowKey, now: DateTime<Utc>, payload: PayloadBuffer) -> Self {
        Self {
            flow,
            state: TcpState::default(),
            payload,
            packets: 0,
            first_seen: now,
            last_seen: now,
            next_seq: None,
            out_of_order: BTreeMap::new(),
        }
    }

    fn duration(&self) -> f64 {
        (self.last_seen - self.first_seen).num_microseconds().unwrap_or(0) as f64 / 1_000_000.0
    }
}

/// Reassembles TCP segments into `Connection` records and emits them on a
/// bounded channel (spec.md §4.2: "the worker queue is bounded; a full
/// queue drops the oldest").
pub struct TcpReassembler {
    streams: Arc<Mutex<HashMap<u64, StreamState>>>,
    output_tx: mpsc::Sender<Connection>,
    connection_timeout: Duration,
    connection_pool: ConnectionPool,
    payload_pool: PayloadPool,
    total_pages: Arc<AtomicCounter>,
    dropped: Arc<AtomicCounter>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpReassembler {
    /// Build a reassembler, its output channel, and start the idle-flush
    /// ticker. `output_capacity` bounds the completed-connection queue
    /// (spec.md recommends 10,000); `connection_timeout` is the idle age at
    /// which a quiet stream is force-closed.
    pub fn new(
        output_capacity: usize,
        connection_timeout: Duration,
        connection_pool: ConnectionPool,
        payload_pool: PayloadPool,
    ) -> (Self, mpsc::Receiver<Connection>) {
        let (output_tx, output_rx) = mpsc::channel(output_capacity);
        let streams = Arc::new(Mutex::new(HashMap::new()));
        let reassembler = Self {
            streams: streams.clone(),
            output_tx: output_tx.clone(),
            connection_timeout,
            connection_pool: connection_pool.clone(),
            payload_pool: payload_pool.clone(),
            total_pages: Arc::new(AtomicCounter::default()),
            dropped: Arc::new(AtomicCounter::default()),
            ticker: Mutex::new(None),
        };
        let handle = spawn_ticker(
            streams,
            output_tx,
            connection_timeout,
            connection_pool,
            payload_pool,
            reassembler.total_pages.clone(),
            reassembler.dropped.clone(),
        );
        *reassembler.ticker.lock() = Some(handle);
        (reassembler, output_rx)
    }

    /// Feed one decoded segment into its stream, creating the stream on
    /// first sight of a flow. May synchronously finalize and emit a
    /// Connection if the segment carries FIN or RST.
    pub async fn assemble(&self, segment: TcpSegment) {
        let canonical = canonical_key(&segment.flow);
        let finished = {
            let mut streams = self.streams.lock();
            let entry = streams
                .entry(canonical)
                .or_insert_with(|| StreamState::new(segment.flow, segment.timestamp, self.payload_pool.get()));

            entry.last_seen = entry.last_seen.max(segment.timestamp);
            entry.packets += 1;
            entry.state.advance(segment.syn, segment.ack, segment.fin, segment.rst);
            append_in_order(entry, segment.seq, segment.payload, &self.total_pages);

            matches!(entry.state, TcpState::Closed) || segment.fin
        };

        if finished {
            self.finalize(canonical).await;
        }
    }

    async fn finalize(&self, canonical: u64) {
        let state = self.streams.lock().remove(&canonical);
        if let Some(state) = state {
            emit(
                state,
                &self.output_tx,
                &self.connection_pool,
                &self.payload_pool,
                &self.dropped,
            )
            .await;
        }
    }

    /// Force-finalize every open stream, used at shutdown to avoid losing
    /// in-flight connections.
    pub async fn flush_all(&self) {
        let keys: Vec<u64> = self.streams.lock().keys().copied().collect();
        for key in keys {
            self.finalize(key).await;
        }
    }

    /// Count of streams currently open.
    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Clone of the output sender, so a `UdpFlowBuilder` can share this
    /// reassembler's completed-connection queue instead of needing one of
    /// its own.
    pub fn output_sender(&self) -> mpsc::Sender<Connection> {
        self.output_tx.clone()
    }

    /// Connections dropped because the output queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

impl Drop for TcpReassembler {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }
}

fn canonical_key(flow: &FlowKey) -> u64 {
    let fwd = flow.fast_hash();
    let rev = flow.reverse().fast_hash();
    fwd.min(rev)
}

fn append_in_order(stream: &mut StreamState, seq: u32, payload: Vec<u8>, total_pages: &AtomicCounter) {
    if payload.is_empty() {
        return;
    }
    let next_seq = *stream.next_seq.get_or_insert(seq);
    if seq == next_seq {
        let len = payload.len() as u32;
        stream.payload.extend_from_slice(&payload);
        stream.next_seq = Some(seq.wrapping_add(len));
        drain_ready(stream, total_pages);
    } else if seq.wrapping_sub(next_seq) as i32 > 0 {
        if stream.out_of_order.len() >= MAX_PAGES_PER_STREAM {
            if let Some((&oldest, _)) = stream.out_of_order.iter().next() {
                stream.out_of_order.remove(&oldest);
                total_pages.sub(1);
            }
        }
        if (total_pages.get() as usize) < MAX_TOTAL_PAGES {
            stream.out_of_order.insert(seq, payload);
            total_pages.inc();
        }
    }
    // seq < next_seq: retransmission or overlap of already-consumed bytes, ignore.
}

fn drain_ready(stream: &mut StreamState, total_pages: &AtomicCounter) {
    while let Some(next_seq) = stream.next_seq {
        match stream.out_of_order.remove(&next_seq) {
            Some(bytes) => {
                let len = bytes.len() as u32;
                stream.payload.extend_from_slice(&bytes);
                stream.next_seq = Some(next_seq.wrapping_add(len));
                total_pages.sub(1);
            }
            None => break,
        }
    }
}

async fn emit(
    mut state: StreamState,
    output_tx: &mpsc::Sender<Connection>,
    connection_pool: &ConnectionPool,
    payload_pool: &PayloadPool,
    dropped: &AtomicCounter,
) {
    if state.packets == 0 || state.payload.is_empty() {
        payload_pool.put(state.payload);
        return;
    }

    let mut conn = connection_pool.get();
    conn.timestamp = state.first_seen;
    conn.uid = state.flow.fast_hash();
    conn.source_ip = state.flow.src_ip.to_string();
    conn.source_port = state.flow.src_port;
    conn.destination_ip = state.flow.dst_ip.to_string();
    conn.destination_port = state.flow.dst_port;
    conn.transport_type = TransportType::Tcp;
    conn.duration = state.duration();
    conn.state = state.state.as_str().to_string();
    conn.payload = std::mem::take(&mut state.payload.0);

    payload_pool.put(state.payload);

    if output_tx.try_send(conn).is_err() {
        dropped.inc();
        tracing::warn!("reassembled-connection queue full, dropping connection");
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_ticker(
    streams: Arc<Mutex<HashMap<u64, StreamState>>>,
    output_tx: mpsc::Sender<Connection>,
    connection_timeout: Duration,
    connection_pool: ConnectionPool,
    payload_pool: PayloadPool,
    total_pages: Arc<AtomicCounter>,
    dropped: Arc<AtomicCounter>,
) -> JoinHandle<()> {
    let _ = total_pages;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            let now = Utc::now();
            let stale: Vec<u64> = {
                let guard = streams.lock();
                guard
                    .iter()
                    .filter(|(_, s)| {
                        now.signed_duration_since(s.last_seen).num_seconds()
                            >= connection_timeout.as_secs() as i64
                    })
                    .map(|(k, _)| *k)
                    .collect()
            };
            for key in stale {
                let state = streams.lock().remove(&key);
                if let Some(state) = state {
                    emit(state, &output_tx, &connection_pool, &payload_pool, &dropped).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn flow() -> FlowKey {
        FlowKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            44000,
            443,
            6,
        )
    }

    fn segment(seq: u32, payload: &[u8], syn: bool, ack: bool, fin: bool) -> TcpSegment {
        TcpSegment {
            flow: flow(),
            seq,
            syn,
            ack,
            fin,
            rst: false,
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn in_order_segments_concatenate_and_emit_on_fin() {
        let (reassembler, mut rx) = TcpReassembler::new(
            16,
            Duration::from_secs(30),
            ConnectionPool::new(4),
            PayloadPool::new(4),
        );

        reassembler.assemble(segment(0, b"", true, false, false)).await;
        reassembler.assemble(segment(1, b"hello ", false, true, false)).await;
        reassembler.assemble(segment(7, b"world", false, true, true)).await;

        let conn = rx.recv().await.expect("connection emitted");
        assert_eq!(conn.payload, b"hello world");
        assert_eq!(conn.state, "FIN_WAIT");
    }

    #[tokio::test]
    async fn out_of_order_segment_is_buffered_then_drained() {
        let (reassembler, mut rx) = TcpReassembler::new(
            16,
            Duration::from_secs(30),
            ConnectionPool::new(4),
            PayloadPool::new(4),
        );

        reassembler.assemble(segment(0, b"", true, false, false)).await;
        reassembler.assemble(segment(7, b"world", false, true, false)).await;
        reassembler.assemble(segment(1, b"hello ", false, true, true)).await;

        let conn = rx.recv().await.expect("connection emitted");
        assert_eq!(conn.payload, b"hello world");
    }

    #[tokio::test]
    async fn rst_closes_and_emits_immediately() {
        let (reassembler, mut rx) = TcpReassembler::new(
            16,
            Duration::from_secs(30),
            ConnectionPool::new(4),
            PayloadPool::new(4),
        );
        reassembler.assemble(segment(0, b"", true, false, false)).await;
        let mut rst = segment(1, b"partial", false, true, false);
        rst.rst = true;
        reassembler.assemble(rst).await;

        let conn = rx.recv().await.expect("connection emitted");
        assert_eq!(conn.state, "CLOSED");
        assert!(reassembler.open_streams() == 0);
    }
}
