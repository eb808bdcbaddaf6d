//! Local connection log.
//!
//! The source writes one JSON document (`{SensorMetadata, Connections}`)
//! and rewrites the whole file on every save, which is O(n^2) total work
//! over a run (spec.md §9 open question #2). This persister instead
//! appends one JSON object per line to `log_file`, and keeps
//! [`export_legacy_snapshot`] around to rebuild the original whole-document
//! shape from the JSONL file when something downstream still expects it.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sentry_reassembly::Connection;

/// Interface identity recorded once per log file, mirroring the source's
/// `Metadata` (network interface name plus its bound addresses).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorMetadata {
    /// Capture interface name.
    pub network_interface: String,
    /// Addresses bound to that interface at startup.
    pub network_address: Vec<String>,
}

/// The legacy whole-document shape: sensor metadata plus every connection
/// recorded so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacySnapshot {
    /// Interface identity for this run.
    pub sensor_metadata: SensorMetadata,
    /// Every connection persisted so far, in write order.
    pub connections: Vec<Connection>,
}

/// Append-only connection log: one JSON object per line, flushed on every
/// write so a crash loses at most the in-flight record.
pub struct Persister {
    file: Mutex<std::fs::File>,
    metadata: SensorMetadata,
}

/// The log file could not be opened or written to.
#[derive(Debug, thiserror::Error)]
pub enum PersisterError {
    /// Underlying file I/O failure.
    #[error("persister io error: {0}")]
    Io(#[from] std::io::Error),
    /// A connection could not be serialized to JSON.
    #[error("persister encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Persister {
    /// Open (creating if absent, appending if present) the log file at
    /// `path` and record `metadata` as this run's sensor identity.
    pub fn open(path: impl AsRef<Path>, metadata: SensorMetadata) -> Result<Self, PersisterError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file), metadata })
    }

    /// Append one connection as a JSON line.
    pub fn save(&self, connection: &Connection) -> Result<(), PersisterError> {
        let mut line = serde_json::to_vec(connection)?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }

    /// Sensor identity recorded for this run.
    pub fn metadata(&self) -> &SensorMetadata {
        &self.metadata
    }
}

/// Rebuild the legacy `{SensorMetadata, Connections}` document from a JSONL
/// log file, for tools that still expect the original whole-document shape.
pub fn export_legacy_snapshot(
    jsonl_path: impl AsRef<Path>,
    metadata: SensorMetadata,
) -> Result<LegacySnapshot, PersisterError> {
    let file = std::fs::File::open(jsonl_path)?;
    let reader = BufReader::new(file);
    let mut connections = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        connections.push(serde_json::from_str(&line)?);
    }
    Ok(LegacySnapshot { sensor_metadata: metadata, connections })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_reassembly::TransportType;

    fn sample_connection() -> Connection {
        let mut c = Connection::default();
        c.uid = 42;
        c.source_ip = "10.0.0.1".into();
        c.source_port = 1234;
        c.destination_ip = "10.0.0.2".into();
        c.destination_port = 443;
        c.transport_type = TransportType::Tcp;
        c
    }

    #[test]
    fn save_appends_one_line_per_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let metadata = SensorMetadata { network_interface: "eth0".into(), network_address: vec!["10.0.0.1".into()] };
        let persister = Persister::open(&path, metadata).unwrap();

        persister.save(&sample_connection()).unwrap();
        persister.save(&sample_connection()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn export_legacy_snapshot_rebuilds_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let metadata = SensorMetadata { network_interface: "eth0".into(), network_address: vec![] };
        let persister = Persister::open(&path, metadata.clone()).unwrap();
        persister.save(&sample_connection()).unwrap();
        persister.save(&sample_connection()).unwrap();

        let snapshot = export_legacy_snapshot(&path, metadata).unwrap();
        assert_eq!(snapshot.connections.len(), 2);
        assert_eq!(snapshot.sensor_metadata.network_interface, "eth0");
    }

    #[test]
    fn reopening_the_log_appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let metadata = SensorMetadata { network_interface: "eth0".into(), network_address: vec![] };

        Persister::open(&path, metadata.clone()).unwrap().save(&sample_connection()).unwrap();
        Persister::open(&path, metadata).unwrap().save(&sample_connection()).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
