//! Per-connection analyzer dispatch (spec.md §4.10): content classification
//! always runs first, then one protocol analyzer is chosen by port, then a
//! single signature scan covering whatever keys that analyzer produced.

use sentry_reassembly::Connection;
use sentry_signatures::{Detect, Request, SignatureDetector};

use crate::{content, dns, http, http2, tls};

const PORT_HTTP: u16 = 80;
const PORT_HTTPS: u16 = 443;
const PORT_HTTPS_ALT: u16 = 8443;
const PORT_DNS: u16 = 53;

fn port_matches(conn: &Connection, port: u16) -> bool {
    conn.source_port == port || conn.destination_port == port
}

/// Run content classification, the matching protocol analyzer, and a
/// signature scan against `conn`, writing analyzer results directly onto
/// it and returning whatever signatures matched.
pub fn dispatch(conn: &mut Connection, detector: &SignatureDetector) -> Vec<Detect> {
    match content::analyze(&conn.payload) {
        Ok(result) => conn.set_analyzer("content", &result),
        Err(err) => tracing::debug!(uid = conn.uid, %err, "content analyzer skipped"),
    }

    let mut request = Request { ip: Some(conn.destination_ip.clone()), port: Some(conn.destination_port), ..Request::default() };

    if port_matches(conn, PORT_HTTP) {
        match http::analyze(&conn.payload) {
            Ok(parsed) => {
                request.tracker_url = Some(http::tracker_url(&parsed));
                conn.set_analyzer("http", &parsed);
            }
            Err(err) => tracing::debug!(uid = conn.uid, %err, "HTTP/1 analyzer skipped"),
        }
    } else if port_matches(conn, PORT_HTTPS) || port_matches(conn, PORT_HTTPS_ALT) {
        match tls::analyze(&conn.payload) {
            Ok(parsed) => {
                request.cert_sha1 = parsed.certificate.as_ref().map(|c| c.sha1.clone());
                let detected_http2 = parsed
                    .application_data
                    .as_ref()
                    .and_then(|app| app.detected_protocol.as_deref())
                    == Some("HTTP/2");
                conn.set_analyzer("tls", &parsed);

                if detected_http2 {
                    // The cleartext body sits past the 5-byte TLS record
                    // header the ApplicationData heuristic matched against.
                    if let Some(body) = conn.payload.get(5..) {
                        if let Ok(parsed) = http2::analyze(body) {
                            conn.set_analyzer("http2", &parsed);
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(uid = conn.uid, %err, "TLS analyzer skipped");
                // Best-effort fallback: some deployments run HTTP/2 in the
                // clear (h2c) on the TLS port during migration. This never
                // covers a genuine TLS session, whose bytes are encrypted
                // past the handshake.
                if http2::looks_like_http2(&conn.payload) {
                    if let Ok(parsed) = http2::analyze(&conn.payload) {
                        conn.set_analyzer("http2", &parsed);
                    }
                }
            }
        }
    } else if port_matches(conn, PORT_DNS) {
        match dns::analyze(&conn.payload) {
            Ok(parsed) => conn.set_analyzer("dns", &parsed),
            Err(err) => tracing::debug!(uid = conn.uid, %err, "DNS analyzer skipped"),
        }
    }

    detector.scan(&request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentry_reassembly::TransportType;

    fn connection(port: u16, payload: Vec<u8>) -> Connection {
        let mut conn = Connection::default();
        conn.destination_port = port;
        conn.destination_ip = "93.184.216.34".into();
        conn.transport_type = TransportType::Tcp;
        conn.payload = payload;
        conn
    }

    #[test]
    fn http_connection_sets_http_key_and_scans_tracker_url() {
        let detector = SignatureDetector::new();
        detector.insert_tracker("example.com/evil".into(), "blocklist".into(), 7);

        let mut conn = connection(80, b"GET /evil HTTP/1.1\r\nHost: example.com\r\n\r\n".to_vec());
        let hits = dispatch(&mut conn, &detector);

        assert!(conn.analyzers.contains_key("http"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, "tracker");
    }

    #[test]
    fn dns_connection_sets_dns_key() {
        let detector = SignatureDetector::new();
        let mut payload = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        payload.extend_from_slice(b"\x07example\x03com\x00");
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());

        let mut conn = connection(53, payload);
        dispatch(&mut conn, &detector);
        assert!(conn.analyzers.contains_key("dns"));
    }

    #[test]
    fn tls_port_with_http2_application_data_also_runs_http2() {
        let detector = SignatureDetector::new();
        let mut payload = vec![23, 0x03, 0x03]; // ApplicationData record, TLS 1.2
        let body = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n".to_vec();
        payload.extend_from_slice(&(body.len() as u16).to_be_bytes());
        payload.extend_from_slice(&body);

        let mut conn = connection(443, payload);
        dispatch(&mut conn, &detector);

        assert!(conn.analyzers.contains_key("tls"));
        assert!(conn.analyzers.contains_key("http2"));
    }

    #[test]
    fn unrecognized_port_only_runs_content() {
        let detector = SignatureDetector::new();
        let mut conn = connection(9999, b"plain text body".to_vec());
        dispatch(&mut conn, &detector);
        assert!(conn.analyzers.contains_key("content"));
        assert!(!conn.analyzers.contains_key("http"));
        assert!(!conn.analyzers.contains_key("tls"));
    }
}
