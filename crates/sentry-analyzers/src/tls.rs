//! TLS record/handshake parsing (spec.md §4.5): enough of the protocol to
//! classify a ClientHello/ServerHello, surface the negotiated cipher and
//! SNI, and describe the leaf certificate when one is presented in the
//! clear (no key exchange, no decryption).

use chrono::{DateTime, Utc};
use sentry_common::AnalyzerError;
use serde::Serialize;
use sha1::{Digest, Sha1};

const RECORD_CHANGE_CIPHER_SPEC: u8 = 20;
const RECORD_ALERT: u8 = 21;
const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APPLICATION_DATA: u8 = 23;

const HS_CLIENT_HELLO: u8 = 1;
const HS_SERVER_HELLO: u8 = 2;
const HS_CERTIFICATE: u8 = 11;

const EXT_SERVER_NAME: u16 = 0;
const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
const EXT_ALPN: u16 = 16;
const EXT_EXTENDED_MASTER_SECRET: u16 = 23;
const EXT_SESSION_TICKET: u16 = 35;
const EXT_RENEGOTIATION_INFO: u16 = 65281;

fn extension_name(id: u16) -> &'static str {
    match id {
        EXT_SERVER_NAME => "server_name",
        EXT_SUPPORTED_GROUPS => "supported_groups",
        EXT_EC_POINT_FORMATS => "ec_point_formats",
        EXT_SIGNATURE_ALGORITHMS => "signature_algorithms",
        EXT_ALPN => "application_layer_protocol_negotiation",
        EXT_EXTENDED_MASTER_SECRET => "extended_master_secret",
        EXT_SESSION_TICKET => "session_ticket",
        EXT_RENEGOTIATION_INFO => "renegotiation_info",
        _ => "unknown",
    }
}

fn cipher_suite_name(id: u16) -> String {
    let name = match id {
        0x0000 => "TLS_NULL_WITH_NULL_NULL",
        0x0001 => "TLS_RSA_WITH_NULL_MD5",
        0x0002 => "TLS_RSA_WITH_NULL_SHA",
        0x002F => "TLS_RSA_WITH_AES_128_CBC_SHA",
        0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
        0x003C => "TLS_RSA_WITH_AES_128_CBC_SHA256",
        0x003D => "TLS_RSA_WITH_AES_256_CBC_SHA256",
        0x009C => "TLS_RSA_WITH_AES_128_GCM_SHA256",
        0x009D => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        0xC009 => "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
        0xC00A => "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
        0xC013 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        0xC014 => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
        0xC02B => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        0xC02C => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        0xC02F => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        0xC030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        0xCCA8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        0xCCA9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        0x1301 => "TLS_AES_128_GCM_SHA256",
        0x1302 => "TLS_AES_256_GCM_SHA384",
        0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
        _ => return format!("Unknown (0x{id:04x})"),
    };
    name.to_string()
}

fn alert_level_name(level: u8) -> &'static str {
    match level {
        1 => "warning",
        2 => "fatal",
        _ => "unknown",
    }
}

fn alert_description_name(desc: u8) -> &'static str {
    match desc {
        0 => "close_notify",
        10 => "unexpected_message",
        20 => "bad_record_mac",
        40 => "handshake_failure",
        42 => "bad_certificate",
        43 => "unsupported_certificate",
        44 => "certificate_revoked",
        45 => "certificate_expired",
        46 => "certificate_unknown",
        47 => "illegal_parameter",
        48 => "unknown_ca",
        49 => "access_denied",
        50 => "decode_error",
        51 => "decrypt_error",
        70 => "protocol_version",
        71 => "insufficient_security",
        80 => "internal_error",
        90 => "user_canceled",
        112 => "unrecognized_name",
        _ => "unknown",
    }
}

fn tls_version_name(version: u16) -> &'static str {
    match version {
        0x0301 => "TLS 1.0",
        0x0302 => "TLS 1.1",
        0x0303 => "TLS 1.2",
        0x0304 => "TLS 1.3",
        _ => "unknown",
    }
}

/// A parsed certificate, present when a `Certificate` handshake message was
/// observed in the clear.
#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    /// Subject distinguished name.
    pub subject: String,
    /// Issuer distinguished name.
    pub issuer: String,
    /// Not-before validity bound.
    pub valid_from: DateTime<Utc>,
    /// Not-after validity bound.
    pub valid_until: DateTime<Utc>,
    /// Subject alternative DNS names.
    pub dns_names: Vec<String>,
    /// Subject common name, if present.
    pub common_name: String,
    /// Decimal serial number.
    pub serial_number: String,
    /// SHA-1 fingerprint of the DER-encoded certificate, used for signature
    /// lookups.
    pub sha1: String,
}

/// Result of parsing one TLS record (spec.md §4.5).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Tls {
    /// Negotiated or offered protocol version, e.g. `"TLS 1.2"`.
    pub version: String,
    /// Server Name Indication from a ClientHello, if present.
    pub sni: Option<String>,
    /// Cipher suites offered by a ClientHello.
    pub supported_ciphers: Vec<String>,
    /// Cipher suite chosen by a ServerHello.
    pub selected_cipher: Option<String>,
    /// Certificate presented in the clear, if any.
    pub certificate: Option<Certificate>,
    /// Handshake message type name (`"ClientHello"`, `"ServerHello"`, ...).
    pub handshake_type: Option<String>,
    /// True if this record carried a ClientHello.
    pub is_client_hello: bool,
    /// True if this record carried a ServerHello.
    pub is_server_hello: bool,
    /// True if this record carried a Certificate message.
    pub is_certificate: bool,
    /// True if this record was an Alert.
    pub is_alert: bool,
    /// Alert level (`"warning"`/`"fatal"`), if this was an Alert.
    pub alert_level: Option<String>,
    /// Alert description, if this was an Alert.
    pub alert_description: Option<String>,
    /// Extension-type-name to presence map, for a ClientHello/ServerHello.
    pub extensions: std::collections::HashMap<String, String>,
    /// Total bytes consumed by the record.
    pub payload_length: usize,
    /// Best-effort classification of trailing ApplicationData, when this
    /// connection is on a TLS port but the first record is encrypted.
    pub application_data: Option<ApplicationData>,
}

/// Heuristic description of an ApplicationData record we cannot decrypt.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationData {
    /// Record payload length.
    pub length: usize,
    /// Always true: this analyzer never decrypts TLS.
    pub is_encrypted: bool,
    /// Best-guess MIME class of the record body, from the same heuristics
    /// `content::analyze` applies. Only meaningful if the record is
    /// actually cleartext, e.g. h2c run on a TLS port.
    pub detected_content_type: Option<String>,
    /// `"HTTP/2"`/`"HTTP/1.1"` when the cleartext heuristic below recognizes
    /// a request line or the HTTP/2 preface at the front of the record.
    pub detected_protocol: Option<String>,
}

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const HTTP_METHODS: &[&[u8]] =
    &[b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH "];

/// Classify an ApplicationData record body per spec.md §4.5: this never
/// decrypts anything, it only catches cleartext traffic riding a TLS port
/// (h2c migrations, misconfigured plaintext listeners).
fn classify_application_data(body: &[u8]) -> (Option<String>, Option<String>) {
    if body.len() >= HTTP2_PREFACE.len() && &body[..HTTP2_PREFACE.len()] == HTTP2_PREFACE {
        return (Some("HTTP/2".to_string()), Some("HTTP/2".to_string()));
    }
    if HTTP_METHODS.iter().any(|m| body.starts_with(m)) {
        return (Some("HTTP/1.1".to_string()), Some("text/plain".to_string()));
    }

    let printable = body.iter().filter(|b| is_printable(**b)).count();
    let ratio = if body.is_empty() { 0.0 } else { printable as f64 / body.len() as f64 };
    (None, Some(detect_content_type(body, ratio)))
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte) || byte == b'\n' || byte == b'\r' || byte == b'\t'
}

fn detect_content_type(body: &[u8], printable_ratio: f64) -> String {
    let prefix2 = &body[..body.len().min(2)];
    if prefix2 == b"{\"" || prefix2 == b"[{" || prefix2 == b"[\"" || prefix2 == b"{\n" || prefix2 == b"{\r" {
        return "application/json".to_string();
    }

    let prefix5 = &body[..body.len().min(5)];
    if prefix5 == b"<?xml" || prefix5 == b"<root" || prefix5 == b"<html" || prefix5 == b"<soap" {
        return "application/xml".to_string();
    }

    if body.len() >= 3 && (body.starts_with(&[0xFF, 0xD8, 0xFF]) || body.starts_with(&[0x89, 0x50, 0x4E])) {
        return "image".to_string();
    }

    if printable_ratio > 0.8 {
        "text/plain".to_string()
    } else {
        "application/octet-stream".to_string()
    }
}

fn be16(data: &[u8], pos: usize) -> Option<u16> {
    data.get(pos..pos + 2).map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn be24(data: &[u8], pos: usize) -> Option<usize> {
    data.get(pos..pos + 3).map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
}

/// Parse one TLS record off the front of `payload`.
pub fn analyze(payload: &[u8]) -> Result<Tls, AnalyzerError> {
    if payload.is_empty() {
        return Err(AnalyzerError::Empty);
    }
    if payload.len() < 5 {
        return Err(AnalyzerError::Truncated("TLS record header".into()));
    }

    let record_type = payload[0];
    let version = be16(payload, 1).unwrap();
    let record_len = be16(payload, 3).unwrap() as usize;

    if payload.len() < 5 + record_len {
        return Err(AnalyzerError::Truncated("TLS record body".into()));
    }

    let mut tls = Tls {
        version: tls_version_name(version).to_string(),
        payload_length: 5 + record_len,
        ..Tls::default()
    };

    let body = &payload[5..5 + record_len];

    match record_type {
        RECORD_HANDSHAKE => parse_handshake(body, &mut tls)?,
        RECORD_ALERT => parse_alert(body, &mut tls)?,
        RECORD_APPLICATION_DATA => {
            let (detected_protocol, detected_content_type) = classify_application_data(body);
            tls.application_data = Some(ApplicationData {
                length: body.len(),
                is_encrypted: true,
                detected_content_type,
                detected_protocol,
            });
        }
        RECORD_CHANGE_CIPHER_SPEC => {}
        other => return Err(AnalyzerError::InvalidFormat(format!("unknown TLS record type {other}"))),
    }

    Ok(tls)
}

fn parse_alert(body: &[u8], tls: &mut Tls) -> Result<(), AnalyzerError> {
    if body.len() < 2 {
        return Err(AnalyzerError::Truncated("TLS alert".into()));
    }
    tls.is_alert = true;
    tls.alert_level = Some(alert_level_name(body[0]).to_string());
    tls.alert_description = Some(alert_description_name(body[1]).to_string());
    Ok(())
}

fn parse_handshake(body: &[u8], tls: &mut Tls) -> Result<(), AnalyzerError> {
    if body.len() < 4 {
        return Err(AnalyzerError::Truncated("TLS handshake header".into()));
    }
    let handshake_type = body[0];
    let length = be24(body, 1).ok_or_else(|| AnalyzerError::Truncated("handshake length".into()))?;
    if body.len() < 4 + length {
        return Err(AnalyzerError::Truncated("handshake body".into()));
    }
    let hs_body = &body[4..4 + length];

    tls.handshake_type = Some(handshake_type_name(handshake_type).to_string());

    match handshake_type {
        HS_CLIENT_HELLO => {
            tls.is_client_hello = true;
            parse_client_hello(hs_body, tls)?;
        }
        HS_SERVER_HELLO => {
            tls.is_server_hello = true;
            parse_server_hello(hs_body, tls)?;
        }
        HS_CERTIFICATE => {
            tls.is_certificate = true;
            tls.certificate = parse_certificate_message(hs_body);
        }
        _ => {}
    }

    Ok(())
}

fn handshake_type_name(t: u8) -> &'static str {
    match t {
        HS_CLIENT_HELLO => "ClientHello",
        HS_SERVER_HELLO => "ServerHello",
        HS_CERTIFICATE => "Certificate",
        12 => "ServerKeyExchange",
        13 => "CertificateRequest",
        14 => "ServerHelloDone",
        15 => "CertificateVerify",
        16 => "ClientKeyExchange",
        20 => "Finished",
        _ => "Unknown",
    }
}

fn parse_client_hello(body: &[u8], tls: &mut Tls) -> Result<(), AnalyzerError> {
    if body.len() < 34 {
        return Err(AnalyzerError::Truncated("ClientHello".into()));
    }
    let mut pos = 34; // client_version(2) + random(32)

    let session_id_len = *body.get(pos).ok_or_else(|| AnalyzerError::Truncated("session id length".into()))? as usize;
    pos += 1 + session_id_len;

    let cipher_len = be16(body, pos).ok_or_else(|| AnalyzerError::Truncated("cipher suite length".into()))? as usize;
    pos += 2;
    let cipher_bytes = body.get(pos..pos + cipher_len).ok_or_else(|| AnalyzerError::Truncated("cipher suites".into()))?;
    tls.supported_ciphers = cipher_bytes.chunks_exact(2).map(|c| cipher_suite_name(u16::from_be_bytes([c[0], c[1]]))).collect();
    pos += cipher_len;

    let comp_len = *body.get(pos).ok_or_else(|| AnalyzerError::Truncated("compression methods".into()))? as usize;
    pos += 1 + comp_len;

    if let Some(ext_len) = be16(body, pos) {
        pos += 2;
        let ext_end = (pos + ext_len as usize).min(body.len());
        parse_extensions(&body[pos..ext_end], tls);
    }

    Ok(())
}

fn parse_server_hello(body: &[u8], tls: &mut Tls) -> Result<(), AnalyzerError> {
    if body.len() < 34 {
        return Err(AnalyzerError::Truncated("ServerHello".into()));
    }
    let mut pos = 34;
    let session_id_len = *body.get(pos).ok_or_else(|| AnalyzerError::Truncated("session id length".into()))? as usize;
    pos += 1 + session_id_len;

    let cipher = be16(body, pos).ok_or_else(|| AnalyzerError::Truncated("selected cipher".into()))?;
    tls.selected_cipher = Some(cipher_suite_name(cipher));
    pos += 2;

    pos += 1; // compression method

    if let Some(ext_len) = be16(body, pos) {
        pos += 2;
        let ext_end = (pos + ext_len as usize).min(body.len());
        parse_extensions(&body[pos..ext_end], tls);
    }

    Ok(())
}

fn parse_extensions(mut data: &[u8], tls: &mut Tls) {
    while data.len() >= 4 {
        let ext_type = u16::from_be_bytes([data[0], data[1]]);
        let ext_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + ext_len {
            break;
        }
        let ext_data = &data[4..4 + ext_len];

        tls.extensions.insert(extension_name(ext_type).to_string(), format!("0x{ext_type:04x}"));

        if ext_type == EXT_SERVER_NAME {
            tls.sni = parse_sni(ext_data);
        }

        data = &data[4 + ext_len..];
    }
}

fn parse_sni(ext_data: &[u8]) -> Option<String> {
    if ext_data.len() < 5 {
        return None;
    }
    let name_len = u16::from_be_bytes([ext_data[3], ext_data[4]]) as usize;
    ext_data.get(5..5 + name_len).map(|b| String::from_utf8_lossy(b).into_owned())
}

fn parse_certificate_message(body: &[u8]) -> Option<Certificate> {
    // 3-byte total-length prefix, then a list of 3-byte-length-prefixed DER certs.
    let total_len = be24(body, 0)?;
    let list = body.get(3..3 + total_len)?;
    let cert_len = be24(list, 0)?;
    let der = list.get(3..3 + cert_len)?;

    let sha1 = {
        let mut hasher = Sha1::new();
        hasher.update(der);
        hex::encode(hasher.finalize())
    };

    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => {
            let subject = cert.subject().to_string();
            let issuer = cert.issuer().to_string();
            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string();
            let dns_names = cert
                .subject_alternative_name()
                .ok()
                .flatten()
                .map(|ext| {
                    ext.value
                        .general_names
                        .iter()
                        .filter_map(|name| match name {
                            x509_parser::extensions::GeneralName::DNSName(dns) => Some(dns.to_string()),
                            _ => None,
                        })
                        .collect()
                })
                .unwrap_or_default();
            let validity = cert.validity();
            let valid_from = DateTime::from_timestamp(validity.not_before.timestamp(), 0).unwrap_or_default();
            let valid_until = DateTime::from_timestamp(validity.not_after.timestamp(), 0).unwrap_or_default();

            Some(Certificate {
                subject,
                issuer,
                valid_from,
                valid_until,
                dns_names,
                common_name,
                serial_number: cert.raw_serial_as_string(),
                sha1,
            })
        }
        Err(_) => Some(Certificate {
            subject: String::new(),
            issuer: String::new(),
            valid_from: DateTime::<Utc>::default(),
            valid_until: DateTime::<Utc>::default(),
            dns_names: Vec::new(),
            common_name: String::new(),
            serial_number: String::new(),
            sha1,
        }),
    }
}
