//! HTTP/1 request parsing (spec.md §4.6): a single request line plus
//! headers read off the front of a TCP stream's payload. No response
//! parsing — passive capture of the client side only, matching the
//! source's one-sided `http.ReadRequest` use.

use std::collections::HashMap;

use sentry_common::AnalyzerError;
use serde::Serialize;

/// One parsed HTTP/1 request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRequest {
    /// Request method (`GET`, `POST`, ...).
    pub method: String,
    /// Request target as it appeared on the wire.
    pub url: String,
    /// Header names lower-cased, values as received.
    pub headers: HashMap<String, String>,
    /// `Content-Length`, if present and well-formed.
    pub content_length: Option<u64>,
    /// `Host` header value.
    pub host: String,
    /// `Transfer-Encoding` header value, if present.
    pub transfer_encoding: Option<String>,
}

const MAX_HEADERS: usize = 64;

/// Parse one HTTP/1 request line and headers off the front of `payload`.
/// Returns `AnalyzerError::InvalidFormat` if the first line isn't a
/// recognizable request line (most likely: this isn't HTTP traffic at all).
pub fn analyze(payload: &[u8]) -> Result<HttpRequest, AnalyzerError> {
    if payload.is_empty() {
        return Err(AnalyzerError::Empty);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(payload) {
        Ok(httparse::Status::Partial) => Err(AnalyzerError::Truncated("incomplete HTTP/1 request".into())),
        Err(err) => Err(AnalyzerError::InvalidFormat(format!("not an HTTP/1 request: {err}"))),
        Ok(httparse::Status::Complete(_)) => {
            let method = req.method.ok_or_else(|| AnalyzerError::InvalidFormat("missing method".into()))?;
            if !is_known_method(method) {
                return Err(AnalyzerError::InvalidFormat("not an HTTP/1 request line".into()));
            }
            let url = req.path.ok_or_else(|| AnalyzerError::InvalidFormat("missing request target".into()))?;

            let mut request = HttpRequest { method: method.to_string(), url: url.to_string(), ..HttpRequest::default() };

            for header in req.headers.iter() {
                let name = header.name.to_ascii_lowercase();
                let value = String::from_utf8_lossy(header.value).into_owned();

                match name.as_str() {
                    "host" => request.host = value.clone(),
                    "content-length" => request.content_length = value.parse().ok(),
                    "transfer-encoding" => request.transfer_encoding = Some(value.clone()),
                    _ => {}
                }
                request.headers.insert(name, value);
            }

            Ok(request)
        }
    }
}

fn is_known_method(method: &str) -> bool {
    matches!(method, "GET" | "POST" | "PUT" | "DELETE" | "HEAD" | "OPTIONS" | "PATCH" | "CONNECT" | "TRACE")
}

/// Build the tracker URL used as a signature lookup key: `host + url`,
/// unless `url` is just `"/"`, in which case the bare host is used.
pub fn tracker_url(request: &HttpRequest) -> String {
    if request.url == "/" {
        request.host.clone()
    } else {
        format!("{}{}", request.host, request.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nContent-Length: 12\r\n\r\n";
        let request = analyze(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/index.html");
        assert_eq!(request.host, "example.com");
        assert_eq!(request.content_length, Some(12));
    }

    #[test]
    fn non_http_payload_is_invalid_format() {
        assert!(matches!(analyze(b"\x16\x03\x01\x00\x05"), Err(AnalyzerError::InvalidFormat(_))));
    }

    #[test]
    fn unknown_method_is_invalid_format() {
        let raw = b"FOO / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert!(matches!(analyze(raw), Err(AnalyzerError::InvalidFormat(_))));
    }

    #[test]
    fn chunked_transfer_encoding_is_captured() {
        let raw = b"POST /upload HTTP/1.1\r\nHost: example.com\r\nTransfer-Encoding: chunked\r\n\r\n";
        let request = analyze(raw).unwrap();
        assert_eq!(request.transfer_encoding.as_deref(), Some("chunked"));
    }

    #[test]
    fn partial_request_is_truncated() {
        let raw = b"GET /index.html HTTP/1.1\r\nHost: example";
        assert!(matches!(analyze(raw), Err(AnalyzerError::Truncated(_))));
    }

    #[test]
    fn tracker_url_drops_bare_slash() {
        let request = HttpRequest { host: "example.com".into(), url: "/".into(), ..HttpRequest::default() };
        assert_eq!(tracker_url(&request), "example.com");

        let request = HttpRequest { host: "example.com".into(), url: "/path".into(), ..HttpRequest::default() };
        assert_eq!(tracker_url(&request), "example.com/path");
    }
}
