//! Top-level wiring: capture loops feed the reassemblers, a bounded pool of
//! workers drains completed connections through the dispatcher, and a 5s
//! stats task logs throughput (spec.md §4.11). No global state — every
//! subsystem is constructed explicitly and held behind `Arc` so capture
//! threads, workers, and the stats/agent tasks can all reach it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sentry_agent::{AgentClient, AgentState};
use sentry_analyzers::dispatch;
use sentry_capture::{CaptureConfig, CaptureStrategy, PacketDataSource, StrategyRegistry};
use sentry_common::{PipelineStats, SentryError};
use sentry_reassembly::{Connection, ConnectionPool, PayloadPool, TcpReassembler, UdpFlowBuilder};
use sentry_signatures::SignatureDetector;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::decode::{decode, Decoded};
use crate::persister::{Persister, SensorMetadata};

const OUTPUT_QUEUE_CAPACITY: usize = 10_000;
const CONNECTION_POOL_CAPACITY: usize = 10_000;
const PAYLOAD_POOL_CAPACITY: usize = 10_000;
const AGENT_CONNECTION_BUFFER: usize = 100_000;
const AGENT_SIGNATURE_BUFFER: usize = 50_000;
const STATS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Everything the sensor needs for one run: capture sources, the
/// reassembly/analysis pipeline, and (in agent mode) the uploader.
pub struct Sensor {
    config: Config,
    strategy: std::sync::Mutex<Box<dyn CaptureStrategy>>,
    sources: std::sync::Mutex<Vec<Box<dyn PacketDataSource>>>,
    tcp: Arc<TcpReassembler>,
    udp: Arc<UdpFlowBuilder>,
    output_rx: std::sync::Mutex<Option<tokio::sync::mpsc::Receiver<Connection>>>,
    detector: Arc<SignatureDetector>,
    persister: Arc<Persister>,
    agent: Option<Arc<AgentState>>,
    stats: Arc<PipelineStats>,
    semaphore: Arc<Semaphore>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl Sensor {
    /// Open the configured capture strategy, build the reassembly and
    /// agent subsystems, and open the local log. Fatal at startup on any
    /// failure (spec.md §4.1, §7): unknown strategy, capture open failure,
    /// or an unwritable log file.
    pub fn build(config: Config) -> Result<Self, SentryError> {
        let registry = StrategyRegistry::with_defaults();
        let mut strategy = registry.create(&config.strategy)?;

        let capture_config = CaptureConfig {
            interface: config.interface.clone(),
            promiscuous: config.promiscuous,
            snapshot_length: config.snapshot_length,
            number_of_rings: config.number_of_rings,
            bpf: config.bpf.clone(),
            zero_copy: config.zero_copy,
        };
        let sources = strategy.open(&capture_config)?;

        let connection_pool = ConnectionPool::new(CONNECTION_POOL_CAPACITY);
        let payload_pool = PayloadPool::new(PAYLOAD_POOL_CAPACITY);

        let (tcp, output_rx) = TcpReassembler::new(
            OUTPUT_QUEUE_CAPACITY,
            config.connection_timeout(),
            connection_pool.clone(),
            payload_pool,
        );
        let tcp = Arc::new(tcp);
        let udp = Arc::new(UdpFlowBuilder::new(tcp.output_sender(), connection_pool.clone()));

        let metadata = SensorMetadata {
            network_interface: config.interface.clone(),
            network_address: interface_addresses(&config.interface),
        };
        let persister = Arc::new(
            Persister::open(&config.log_file, metadata).map_err(|e| SentryError::StorageOpen(e.to_string()))?,
        );

        let stats = Arc::new(PipelineStats::default());

        let agent = if config.agent_mode {
            let client = AgentClient::new(config.server_url.clone(), config.agent_token.clone());
            Some(Arc::new(AgentState::new(
                client,
                config.agent_id.clone(),
                hostname(),
                config.interface.clone(),
                AGENT_CONNECTION_BUFFER,
                AGENT_SIGNATURE_BUFFER,
                stats.clone(),
            )))
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(16);
        // spec.md §4.11: semaphore caps concurrent analyzer tasks at 2x workers.
        let semaphore = Arc::new(Semaphore::new(2 * config.worker_count()));

        Ok(Self {
            config,
            strategy: std::sync::Mutex::new(strategy),
            sources: std::sync::Mutex::new(sources),
            tcp,
            udp,
            output_rx: std::sync::Mutex::new(Some(output_rx)),
            detector: Arc::new(SignatureDetector::new()),
            persister,
            agent,
            stats,
            semaphore,
            connection_pool,
            shutdown_tx,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run until a shutdown signal arrives: spawn one capture loop per
    /// opened source, spawn the connection-worker loop, spawn the 5s stats
    /// task and (in agent mode) the batching/health tasks, then wait for
    /// SIGINT/SIGTERM.
    pub async fn run(self: Arc<Self>) -> Result<(), SentryError> {
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let sources = std::mem::take(&mut *self.sources.lock().unwrap());
        for source in sources {
            let this = self.clone();
            let mut shutdown_rx = this.shutdown_tx.subscribe();
            handles.push(tokio::task::spawn_blocking(move || {
                this.capture_loop(source, &mut shutdown_rx);
            }));
        }

        let mut output_rx = self.output_rx.lock().unwrap().take().expect("run() called more than once");
        let worker_self = self.clone();
        handles.push(tokio::spawn(async move {
            worker_self.worker_loop(&mut output_rx).await;
        }));

        handles.push(self.clone().spawn_stats_task());

        if let Some(agent) = self.agent.clone() {
            handles.push(sentry_agent::spawn_data_task(agent.clone(), self.config.data_interval()));
            handles.push(sentry_agent::spawn_health_task(agent, self.config.health_interval()));
        }

        tokio::signal::ctrl_c().await.map_err(SentryError::Io)?;
        self.shutdown().await;
        for handle in handles {
            handle.abort();
        }
        Ok(())
    }

    fn capture_loop(&self, mut source: Box<dyn PacketDataSource>, shutdown_rx: &mut broadcast::Receiver<()>) {
        let handle = tokio::runtime::Handle::current();
        loop {
            if shutdown_rx.try_recv().is_ok() || self.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            let read = if self.config.zero_copy { source.zero_copy_read_packet_data() } else { source.read_packet_data() };
            match read {
                Ok((frame, info)) => {
                    self.stats.received.inc();
                    let timestamp: chrono::DateTime<chrono::Utc> = info.timestamp.into();
                    match decode(&frame, timestamp) {
                        Some(Decoded::Tcp(segment)) => handle.block_on(self.tcp.assemble(segment)),
                        Some(Decoded::Udp(datagram)) => self.udp.build(datagram),
                        None => { self.stats.dropped.inc(); }
                    }
                }
                Err(_) => {
                    // Capture handle closed (shutdown) or a transient read
                    // error; either way there is nothing useful to decode.
                    if self.shutting_down.load(Ordering::Relaxed) {
                        return;
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, output_rx: &mut tokio::sync::mpsc::Receiver<Connection>) {
        while let Some(conn) = output_rx.recv().await {
            match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => {
                    let detector = self.detector.clone();
                    let persister = self.persister.clone();
                    let agent = self.agent.clone();
                    let stats = self.stats.clone();
                    let pool = self.connection_pool.clone();
                    tokio::spawn(async move {
                        process_connection(conn, &detector, &persister, agent.as_deref(), &stats, &pool);
                        drop(permit);
                    });
                }
                Err(_) => {
                    process_connection(
                        conn,
                        &self.detector,
                        &self.persister,
                        self.agent.as_deref(),
                        &self.stats,
                        &self.connection_pool,
                    );
                }
            }
        }
    }

    fn spawn_stats_task(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
            let mut last = self.stats.snapshot();
            loop {
                ticker.tick().await;
                let (received, dropped, processed) = self.stats.snapshot();
                let (last_received, _, last_processed) = last;
                tracing::info!(
                    received,
                    dropped,
                    processed,
                    received_per_5s = received.saturating_sub(last_received),
                    processed_per_5s = processed.saturating_sub(last_processed),
                    "throughput summary"
                );
                last = (received, dropped, processed);
            }
        })
    }

    /// Signal every long-running task to stop, close the capture strategy,
    /// and give in-flight workers a moment to drain (spec.md §4.14).
    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(());
        self.strategy.lock().unwrap().close();
        self.tcp.flush_all().await;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
}

fn process_connection(
    mut conn: Connection,
    detector: &SignatureDetector,
    persister: &Persister,
    agent: Option<&AgentState>,
    stats: &PipelineStats,
    pool: &ConnectionPool,
) {
    let detects = dispatch(&mut conn, detector);

    if let Err(err) = persister.save(&conn) {
        tracing::warn!(uid = conn.uid, %err, "failed to persist connection");
    }

    if let Some(agent) = agent {
        agent.record_connection(conn.clone());
        agent.record_signatures(detects);
    }

    stats.processed.inc();
    pool.put(conn);
}

fn hostname() -> String {
    hostname_impl().unwrap_or_else(|| "unknown".into())
}

#[cfg(unix)]
fn hostname_impl() -> Option<String> {
    std::env::var("HOSTNAME").ok().or_else(|| {
        let output = std::process::Command::new("hostname").output().ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    })
}

#[cfg(not(unix))]
fn hostname_impl() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}

fn interface_addresses(_interface: &str) -> Vec<String> {
    // Best-effort: the source shells out to the OS network stack for this;
    // a real implementation would bind a socket per address family and read
    // back the local address, which needs platform-specific code this
    // sensor does not otherwise require. Left empty rather than guessed.
    Vec::new()
}
