//! Manager-facing HTTP client: registration, batched connection/signature
//! upload, and periodic health pings, each wrapped in the same bounded
//! retry loop (spec.md §4.12).

use std::io::Write;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sentry_reassembly::Connection;
use sentry_signatures::Detect;
use serde::{Deserialize, Serialize};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_MS: u64 = 500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One-time registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRegistration {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Reporting host's hostname.
    pub hostname: String,
    /// Capture interface name.
    pub interface: String,
    /// Sensor build version.
    pub version: String,
}

/// Pipeline throughput counters shipped on every health ping.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    /// Packets read from the capture source.
    pub packets_received: u64,
    /// Packets dropped (channel full, decode failure).
    pub packets_dropped: u64,
    /// Packets handed to a worker and fully processed.
    pub packets_processed: u64,
    /// Connections completed by the reassembly stage.
    pub connections_found: u64,
}

/// One batch of completed connections and matched signatures.
#[derive(Debug, Clone, Serialize)]
pub struct AgentData {
    /// Stable agent identifier.
    pub agent_id: String,
    /// Reporting host's hostname.
    pub hostname: String,
    /// Capture interface name.
    pub interface: String,
    /// Batch assembly time.
    pub timestamp: DateTime<Utc>,
    /// Connections in this batch.
    pub connections: Vec<Connection>,
    /// Signatures matched against connections in this batch.
    pub signatures: Vec<Detect>,
    /// Pipeline counters at batch assembly time.
    pub stats: AgentStats,
}

/// Manager's reply to any of the three agent endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    /// True if the manager accepted the request.
    pub success: bool,
    /// Human-readable status message.
    #[serde(default)]
    pub message: String,
    /// Error detail, present when `success` is false.
    #[serde(default)]
    pub error: String,
}

/// Thin HTTPS client for the three manager endpoints, bearer-authenticated
/// and gzip-compressed on the way out.
pub struct AgentClient {
    server_url: String,
    token: String,
    client: reqwest::Client,
}

/// Failure modes for a single manager request, after retries are exhausted.
#[derive(Debug, thiserror::Error)]
pub enum AgentClientError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The manager responded with a non-2xx status.
    #[error("manager rejected request: {0}")]
    Rejected(String),
    /// Failed to gzip-encode the outgoing JSON body.
    #[error("gzip encoding failed: {0}")]
    Encode(#[from] std::io::Error),
}

impl AgentClient {
    /// Build a client against `server_url`, authenticating with `token`.
    pub fn new(server_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { server_url: server_url.into(), token: token.into(), client }
    }

    /// Register this agent with the manager, retried up to `MAX_ATTEMPTS`
    /// times with doubling backoff.
    pub async fn register(&self, registration: &AgentRegistration) -> Result<AgentResponse, AgentClientError> {
        self.post_with_retry("/api/agent/register", registration).await
    }

    /// Upload one batch of connections and signatures.
    pub async fn send_data(&self, data: &AgentData) -> Result<AgentResponse, AgentClientError> {
        self.post_with_retry("/api/agent/data", data).await
    }

    /// Send a health/stats ping. A plain bearer-authenticated `GET`, and
    /// unlike `register`/`send_data` it is not retried: a failed ping just
    /// waits for the next interval (spec.md §8 scenario 5).
    pub async fn send_health(&self, agent_id: &str) -> Result<AgentResponse, AgentClientError> {
        let url = format!("{}/api/agent/health", self.server_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("agent_id", agent_id)])
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<AgentResponse>().await?)
        } else {
            let status = response.status();
            let _ = response.bytes().await;
            Err(AgentClientError::Rejected(format!("status {status}")))
        }
    }

    async fn post_with_retry<T: Serialize>(&self, path: &str, body: &T) -> Result<AgentResponse, AgentClientError> {
        let compressed = gzip_json(body)?;
        let url = format!("{}{path}", self.server_url);

        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }

            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .header("Content-Type", "application/json")
                .header("Content-Encoding", "gzip")
                .body(compressed.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    return response.json::<AgentResponse>().await.map_err(AgentClientError::from);
                }
                Ok(response) if response.status().is_client_error() => {
                    // Auth/validation failures (401, 400, ...) won't succeed
                    // on retry, so fail fast instead of burning the backoff
                    // schedule (spec.md §8 scenario 5).
                    let status = response.status();
                    let _ = response.bytes().await;
                    return Err(AgentClientError::Rejected(format!("status {status}")));
                }
                Ok(response) => {
                    // Drain the body so the connection can be reused by the
                    // pool before the next attempt.
                    let status = response.status();
                    let _ = response.bytes().await;
                    last_err = Some(AgentClientError::Rejected(format!("status {status}")));
                }
                Err(err) => last_err = Some(AgentClientError::from(err)),
            }
        }

        Err(last_err.expect("at least one attempt is made"))
    }
}

fn gzip_json<T: Serialize>(value: &T) -> Result<Vec<u8>, AgentClientError> {
    let json = serde_json::to_vec(value).expect("serializable agent payload");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn gzip_json_round_trips_through_flate2() {
        use flate2::read::GzDecoder;
        use std::io::Read as _;

        let stats = AgentStats { packets_received: 10, ..AgentStats::default() };
        let compressed = gzip_json(&stats).unwrap();

        let mut decompressed = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut decompressed).unwrap();
        assert!(decompressed.contains("\"packets_received\":10"));
    }

    /// Accepts one connection, checks the `Authorization` header against
    /// `expected_token`, and replies 200 on a match or 401 otherwise.
    fn spawn_bearer_check_server(expected_token: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let authorized = request.contains(&format!("Bearer {expected_token}"));
                let body = if authorized {
                    r#"{"success":true,"message":"ok","error":""}"#
                } else {
                    r#"{"success":false,"message":"","error":"unauthorized"}"#
                };
                let status_line = if authorized { "200 OK" } else { "401 Unauthorized" };
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn register_with_matching_bearer_succeeds() {
        let url = spawn_bearer_check_server("tok");
        let client = AgentClient::new(url, "tok");
        let registration = AgentRegistration {
            agent_id: "agent-1".into(),
            hostname: "host".into(),
            interface: "eth0".into(),
            version: "0.1.0".into(),
        };
        let response = client.register(&registration).await.unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn register_with_mismatched_bearer_fails_without_retry_delay() {
        let url = spawn_bearer_check_server("tok");
        let client = AgentClient::new(url, "wrong");
        let registration = AgentRegistration {
            agent_id: "agent-1".into(),
            hostname: "host".into(),
            interface: "eth0".into(),
            version: "0.1.0".into(),
        };
        let started = std::time::Instant::now();
        let err = client.register(&registration).await.unwrap_err();
        assert!(matches!(err, AgentClientError::Rejected(_)));
        assert!(started.elapsed() < Duration::from_secs(2), "401 must fail fast, not run the retry schedule");
    }
}
