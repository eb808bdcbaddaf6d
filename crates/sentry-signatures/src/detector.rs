//! In-memory signature tables and the four-lookup scan.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One connection's worth of lookup keys handed to [`SignatureDetector::scan`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// IP address to check against the IP and botnet tables.
    pub ip: Option<String>,
    /// Port, required alongside `ip` for a botnet match.
    pub port: Option<u16>,
    /// Tracker URL, built by the HTTP/1 analyzer (host + path).
    pub tracker_url: Option<String>,
    /// SHA-1 fingerprint of a TLS certificate.
    pub cert_sha1: Option<String>,
}

/// One matched signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detect {
    /// Provider category: `"ip"`, `"botnet"`, `"tracker"`, or `"cert"`.
    pub kind: String,
    /// Human-readable provider name.
    pub provider: String,
    /// Provider-assigned signature id.
    pub signature_id: i64,
}

#[derive(Debug, Clone)]
struct Signature {
    provider: String,
    signature_id: i64,
}

/// Four independent lookup tables, each joined implicitly against a
/// provider name recorded alongside the entry.
#[derive(Default)]
pub struct SignatureDetector {
    by_ip: DashMap<String, Vec<Signature>>,
    by_botnet: DashMap<(String, u16), Vec<Signature>>,
    by_tracker: DashMap<String, Vec<Signature>>,
    by_cert: DashMap<String, Vec<Signature>>,
}

impl SignatureDetector {
    /// Build an empty detector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or silently ignore if already present) an IP signature.
    pub fn insert_ip(&self, ip: String, provider: String, signature_id: i64) {
        insert_unique(&self.by_ip, ip, provider, signature_id);
    }

    /// Insert a botnet IP+port signature.
    pub fn insert_botnet(&self, ip: String, port: u16, provider: String, signature_id: i64) {
        insert_unique(&self.by_botnet, (ip, port), provider, signature_id);
    }

    /// Insert a tracker URL signature.
    pub fn insert_tracker(&self, url: String, provider: String, signature_id: i64) {
        insert_unique(&self.by_tracker, url, provider, signature_id);
    }

    /// Insert a certificate SHA-1 signature.
    pub fn insert_cert(&self, sha1: String, provider: String, signature_id: i64) {
        insert_unique(&self.by_cert, sha1, provider, signature_id);
    }

    /// Run all four lookups relevant to `req` and return every match.
    ///
    /// The certificate lookup gates on `req.cert_sha1` being present, not on
    /// `req.tracker_url` — the source's `Scan()` checked `TrackerURL != ""`
    /// before querying the cert table by `CertSHA1`, so a connection with a
    /// tracker URL but no certificate (any non-TLS connection) would run a
    /// cert lookup keyed on an empty string, and a TLS connection with a
    /// certificate but no tracker URL would skip the cert lookup entirely.
    pub fn scan(&self, req: &Request) -> Vec<Detect> {
        let mut hits = Vec::new();

        if let Some(ip) = &req.ip {
            if let Some(sigs) = self.by_ip.get(ip) {
                hits.extend(sigs.iter().map(|s| Detect {
                    kind: "ip".to_string(),
                    provider: s.provider.clone(),
                    signature_id: s.signature_id,
                }));
            }
        }

        if let (Some(ip), Some(port)) = (&req.ip, req.port) {
            if let Some(sigs) = self.by_botnet.get(&(ip.clone(), port)) {
                hits.extend(sigs.iter().map(|s| Detect {
                    kind: "botnet".to_string(),
                    provider: s.provider.clone(),
                    signature_id: s.signature_id,
                }));
            }
        }

        if let Some(url) = &req.tracker_url {
            if let Some(sigs) = self.by_tracker.get(url) {
                hits.extend(sigs.iter().map(|s| Detect {
                    kind: "tracker".to_string(),
                    provider: s.provider.clone(),
                    signature_id: s.signature_id,
                }));
            }
        }

        if let Some(sha1) = &req.cert_sha1 {
            if let Some(sigs) = self.by_cert.get(sha1) {
                hits.extend(sigs.iter().map(|s| Detect {
                    kind: "cert".to_string(),
                    provider: s.provider.clone(),
                    signature_id: s.signature_id,
                }));
            }
        }

        hits
    }
}

fn insert_unique<K: std::hash::Hash + Eq>(
    table: &DashMap<K, Vec<Signature>>,
    key: K,
    provider: String,
    signature_id: i64,
) {
    let mut entry = table.entry(key).or_default();
    if !entry.iter().any(|s| s.signature_id == signature_id && s.provider == provider) {
        entry.push(Signature { provider, signature_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_and_botnet_both_match() {
        let detector = SignatureDetector::new();
        detector.insert_ip("1.2.3.4".into(), "feodo".into(), 1);
        detector.insert_botnet("1.2.3.4".into(), 6667, "feodo".into(), 2);

        let hits = detector.scan(&Request {
            ip: Some("1.2.3.4".into()),
            port: Some(6667),
            tracker_url: None,
            cert_sha1: None,
        });

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().any(|h| h.kind == "ip"));
        assert!(hits.iter().any(|h| h.kind == "botnet"));
    }

    #[test]
    fn cert_lookup_requires_cert_sha1_not_tracker_url() {
        let detector = SignatureDetector::new();
        detector.insert_cert("deadbeef".into(), "ca-blocklist".into(), 9);

        let tracker_only = detector.scan(&Request {
            ip: None,
            port: None,
            tracker_url: Some("example.com/".into()),
            cert_sha1: None,
        });
        assert!(tracker_only.is_empty());

        let with_cert = detector.scan(&Request {
            ip: None,
            port: None,
            tracker_url: None,
            cert_sha1: Some("deadbeef".into()),
        });
        assert_eq!(with_cert.len(), 1);
        assert_eq!(with_cert[0].kind, "cert");
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let detector = SignatureDetector::new();
        detector.insert_ip("1.1.1.1".into(), "p".into(), 1);
        detector.insert_ip("1.1.1.1".into(), "p".into(), 1);
        let hits = detector.scan(&Request { ip: Some("1.1.1.1".into()), ..Default::default() });
        assert_eq!(hits.len(), 1);
    }
}
