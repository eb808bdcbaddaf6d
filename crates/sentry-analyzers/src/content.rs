//! Content classification: MIME-ish content type, printable-text ratio,
//! decompression, and binary file-signature sniffing (spec.md §4.4).

use std::io::Read;

use flate2::read::{GzDecoder, ZlibDecoder};
use sentry_common::AnalyzerError;
use serde::Serialize;

const FILE_SIGNATURES: &[(&[u8], &str)] = &[
    (&[0xFF, 0xD8, 0xFF], "JPEG"),
    (&[0x89, 0x50, 0x4E, 0x47], "PNG"),
    (&[0x47, 0x49, 0x46], "GIF"),
    (&[0x42, 0x4D], "BMP"),
    (&[0x25, 0x50, 0x44, 0x46], "PDF"),
    (&[0x50, 0x4B, 0x03, 0x04], "ZIP"),
    (&[0x52, 0x61, 0x72, 0x21], "RAR"),
    (&[0x4D, 0x5A], "EXE"),
    (&[0x7F, 0x45, 0x4C, 0x46], "ELF"),
];

/// Result of classifying one connection's payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Content {
    /// Raw payload length in bytes.
    pub payload_length: usize,
    /// Best-guess content type (`application/json`, `text/html`, ...).
    pub content_type: String,
    /// High-level structured-data kind: `"json"`, `"xml"`, or absent.
    pub data_type: Option<String>,
    /// Parsed JSON value, present when `data_type` is `"json"`.
    pub structured_data: Option<serde_json::Value>,
    /// True if more than 70% of bytes are printable ASCII.
    pub is_text: bool,
    /// True if a known binary file signature matched.
    pub is_binary: bool,
    /// Name of the matched file signature, if any.
    pub file_type: Option<String>,
    /// `"gzip"` or `"zlib"` if the payload was successfully decompressed.
    pub compression_type: Option<String>,
    /// Printable text content, present when `is_text` is true.
    pub text_content: Option<String>,
    /// Decompressed bytes, present when `compression_type` is set. Not
    /// serialized: large and only useful to in-process downstream analyzers.
    #[serde(skip)]
    pub decompressed_content: Option<Vec<u8>>,
    /// Tag names pulled out of an XML payload.
    pub xml_tags: Vec<String>,
    /// `http://`/`https://` tokens found in text content.
    pub urls: Vec<String>,
    /// Domain-looking tokens found in text content.
    pub domains: Vec<String>,
}

/// Classify `payload`. Returns `AnalyzerError::Empty` for a zero-length
/// payload (spec.md §4.4 edge case).
pub fn analyze(payload: &[u8]) -> Result<Content, AnalyzerError> {
    if payload.is_empty() {
        return Err(AnalyzerError::Empty);
    }

    let mut content = Content { payload_length: payload.len(), ..Content::default() };

    if let Some((sig, name)) = FILE_SIGNATURES.iter().find(|(sig, _)| payload.starts_with(sig)) {
        content.is_binary = true;
        content.file_type = Some(name.to_string());
        let _ = sig;
    }

    if let Some((kind, bytes)) = decompress(payload) {
        content.compression_type = Some(kind.to_string());
        content.decompressed_content = Some(bytes);
    }

    let printable = payload.iter().filter(|b| is_printable(**b)).count();
    let ratio = printable as f64 / payload.len() as f64;

    content.content_type = detect_content_type(payload, ratio);

    if ratio > 0.7 {
        content.is_text = true;
        content.text_content = Some(String::from_utf8_lossy(payload).into_owned());
    }

    if let Some(text) = content.text_content.clone() {
        match content.content_type.as_str() {
            "application/json" => {
                content.data_type = Some("json".to_string());
                content.structured_data = serde_json::from_slice(payload).ok();
            }
            "application/xml" | "text/html" => {
                content.data_type = Some("xml".to_string());
                content.xml_tags = extract_xml_tags(&text);
            }
            _ => {}
        }
        content.urls = extract_urls(&text);
        content.domains = extract_domains(&text);
    }

    Ok(content)
}

fn is_printable(byte: u8) -> bool {
    (0x20..=0x7e).contains(&byte) || byte == b'\n' || byte == b'\r' || byte == b'\t'
}

fn detect_content_type(payload: &[u8], printable_ratio: f64) -> String {
    let prefix2 = &payload[..payload.len().min(2)];
    if prefix2 == b"{\"" || prefix2 == b"[{" || prefix2 == b"[\"" || prefix2 == b"{\n" || prefix2 == b"{\r" {
        return "application/json".to_string();
    }

    let prefix5 = &payload[..payload.len().min(5)];
    if prefix5 == b"<?xml" || prefix5 == b"<root" || prefix5 == b"<html" || prefix5 == b"<soap" {
        return "application/xml".to_string();
    }

    if payload.len() >= 6 {
        let lowered: Vec<u8> = payload[..6].iter().map(|b| b.to_ascii_lowercase()).collect();
        if lowered.as_slice() == b"<html>"
            || lowered.as_slice() == b"<!doct"
            || lowered.as_slice() == b"<head>"
        {
            return "text/html".to_string();
        }
    }

    if printable_ratio > 0.8 {
        "text/plain".to_string()
    } else if printable_ratio < 0.7 {
        "application/octet-stream".to_string()
    } else {
        "unknown".to_string()
    }
}

fn decompress(payload: &[u8]) -> Option<(&'static str, Vec<u8>)> {
    if payload.len() >= 2 && payload[0] == 0x1F && payload[1] == 0x8B {
        let mut out = Vec::new();
        GzDecoder::new(payload).read_to_end(&mut out).ok()?;
        return Some(("gzip", out));
    }
    if payload.len() >= 2 && payload[0] == 0x78 && matches!(payload[1], 0x01 | 0x9C | 0xDA) {
        let mut out = Vec::new();
        ZlibDecoder::new(payload).read_to_end(&mut out).ok()?;
        return Some(("zlib", out));
    }
    None
}

fn extract_xml_tags(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|tok| tok.starts_with('<'))
        .map(|tok| tok.to_string())
        .collect()
}

fn extract_urls(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|tok| tok.starts_with("http://") || tok.starts_with("https://"))
        .map(|tok| tok.to_string())
        .collect()
}

fn extract_domains(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|tok| !tok.starts_with("http://") && !tok.starts_with("https://"))
        .map(|tok| tok.trim_end_matches([',', ';', '.']))
        .filter(|tok| tok.contains('.') && tok.len() > 3)
        .map(|tok| tok.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_an_error() {
        assert_eq!(analyze(&[]).unwrap_err(), AnalyzerError::Empty);
    }

    #[test]
    fn png_signature_is_detected() {
        let payload = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        let content = analyze(&payload).unwrap();
        assert!(content.is_binary);
        assert_eq!(content.file_type.as_deref(), Some("PNG"));
    }

    #[test]
    fn json_body_is_classified_as_text() {
        let payload = br#"{"hello": "world"}"#;
        let content = analyze(payload).unwrap();
        assert_eq!(content.content_type, "application/json");
        assert_eq!(content.data_type.as_deref(), Some("json"));
        assert!(content.is_text);
        assert_eq!(content.structured_data, Some(serde_json::json!({"hello": "world"})));
    }

    #[test]
    fn gzip_payload_round_trips() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip world").unwrap();
        let compressed = encoder.finish().unwrap();

        let content = analyze(&compressed).unwrap();
        assert_eq!(content.compression_type.as_deref(), Some("gzip"));
        assert_eq!(content.decompressed_content.as_deref(), Some(&b"hello gzip world"[..]));
    }
}
