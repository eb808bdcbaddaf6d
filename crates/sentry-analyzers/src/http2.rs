//! HTTP/2 frame parsing (spec.md §4.7): the connection preface plus a
//! best-effort frame walk. No HPACK decompression — header blocks are kept
//! as opaque fragments.

use sentry_common::AnalyzerError;
use serde::Serialize;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_PUSH_PROMISE: u8 = 0x5;

fn frame_type_name(t: u8) -> String {
    match t {
        0x0 => "DATA".to_string(),
        0x1 => "HEADERS".to_string(),
        0x2 => "PRIORITY".to_string(),
        0x3 => "RST_STREAM".to_string(),
        0x4 => "SETTINGS".to_string(),
        0x5 => "PUSH_PROMISE".to_string(),
        0x6 => "PING".to_string(),
        0x7 => "GOAWAY".to_string(),
        0x8 => "WINDOW_UPDATE".to_string(),
        0x9 => "CONTINUATION".to_string(),
        other => format!("Unknown ({other})"),
    }
}

/// One (identifier, value) pair from a SETTINGS frame.
#[derive(Debug, Clone, Serialize)]
pub struct Setting {
    /// Settings parameter identifier.
    pub identifier: u16,
    /// Settings parameter value.
    pub value: u32,
}

/// One parsed HTTP/2 frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Frame {
    /// Payload length as declared in the frame header.
    pub length: usize,
    /// Frame type name.
    pub frame_type: String,
    /// Frame flags byte.
    pub flags: u8,
    /// Stream identifier (top bit masked off).
    pub stream_id: u32,
    /// SETTINGS entries, present only on SETTINGS frames.
    pub settings: Vec<Setting>,
    /// Header block fragment length, present on HEADERS/PUSH_PROMISE.
    pub header_block_len: Option<usize>,
    /// DATA payload length, present on DATA frames.
    pub data_len: Option<usize>,
    /// Promised stream id, present on PUSH_PROMISE frames.
    pub promised_stream_id: Option<u32>,
}

/// Result of walking a connection's HTTP/2 frames.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Http2 {
    /// `"HTTP/2"` when the connection preface was seen, `"HTTP/2 (detected)"`
    /// for opportunistic detection without one, absent otherwise.
    pub protocol: Option<String>,
    /// True if the payload opened with the HTTP/2 connection preface.
    pub has_preface: bool,
    /// Total bytes consumed.
    pub payload_length: usize,
    /// Every frame parsed, in wire order.
    pub frames: Vec<Frame>,
    /// HEADERS frames only.
    pub headers_frames: Vec<Frame>,
    /// DATA frames only.
    pub data_frames: Vec<Frame>,
    /// SETTINGS frames only.
    pub settings_frames: Vec<Frame>,
    /// PUSH_PROMISE frames only.
    pub push_promise_frames: Vec<Frame>,
    /// Total frames parsed.
    pub total_frames: usize,
    /// Count of DATA frames.
    pub total_data_frames: usize,
    /// Count of HEADERS frames.
    pub total_headers_frames: usize,
}

/// Walk as many complete frames as `payload` contains, optionally preceded
/// by the connection preface.
pub fn analyze(payload: &[u8]) -> Result<Http2, AnalyzerError> {
    if payload.is_empty() {
        return Err(AnalyzerError::Empty);
    }

    let mut http2 = Http2 { payload_length: payload.len(), ..Http2::default() };
    let mut rest = payload;

    if rest.starts_with(PREFACE) {
        http2.has_preface = true;
        http2.protocol = Some("HTTP/2".to_string());
        rest = &rest[PREFACE.len()..];
    }

    while rest.len() >= 9 {
        let length = ((rest[0] as usize) << 16) | ((rest[1] as usize) << 8) | rest[2] as usize;
        let frame_type = rest[3];
        let flags = rest[4];
        let stream_id = u32::from_be_bytes([rest[5], rest[6], rest[7], rest[8]]) & 0x7fff_ffff;

        if rest.len() < 9 + length {
            break; // incomplete trailing frame; stop without erroring
        }
        let body = &rest[9..9 + length];

        let mut frame = Frame { length, frame_type: frame_type_name(frame_type), flags, stream_id, ..Frame::default() };

        match frame_type {
            FRAME_DATA => {
                frame.data_len = Some(body.len());
                http2.total_data_frames += 1;
            }
            FRAME_HEADERS => {
                let fragment_start = if body.len() >= 5 { 5 } else { 0 };
                frame.header_block_len = Some(body.len().saturating_sub(fragment_start));
                http2.total_headers_frames += 1;
            }
            FRAME_SETTINGS => {
                if body.len() % 6 == 0 {
                    frame.settings = body
                        .chunks_exact(6)
                        .map(|c| Setting {
                            identifier: u16::from_be_bytes([c[0], c[1]]),
                            value: u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
                        })
                        .collect();
                }
            }
            FRAME_PUSH_PROMISE => {
                if body.len() >= 4 {
                    frame.promised_stream_id = Some(u32::from_be_bytes([body[0], body[1], body[2], body[3]]) & 0x7fff_ffff);
                    frame.header_block_len = Some(body.len() - 4);
                }
            }
            _ => {}
        }

        match frame_type {
            FRAME_DATA => http2.data_frames.push(frame.clone()),
            FRAME_HEADERS => http2.headers_frames.push(frame.clone()),
            FRAME_SETTINGS => http2.settings_frames.push(frame.clone()),
            FRAME_PUSH_PROMISE => http2.push_promise_frames.push(frame.clone()),
            _ => {}
        }
        http2.frames.push(frame);
        rest = &rest[9 + length..];
    }

    if http2.frames.is_empty() && !http2.has_preface {
        return Err(AnalyzerError::InvalidFormat("no HTTP/2 preface or frames found".into()));
    }

    http2.total_frames = http2.frames.len();
    if http2.protocol.is_none() && !http2.frames.is_empty() {
        http2.protocol = Some("HTTP/2 (detected)".to_string());
    }

    Ok(http2)
}

/// Opportunistic detection for traffic lacking the preface (e.g. a stream
/// that started mid-connection): a frame type byte in range and a plausible
/// length is treated as "probably HTTP/2".
pub fn looks_like_http2(payload: &[u8]) -> bool {
    payload.len() >= 9
        && payload[3] <= 0x9
        && (((payload[0] as usize) << 16) | ((payload[1] as usize) << 8) | payload[2] as usize) <= 16384
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_frame(pairs: &[(u16, u32)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, value) in pairs {
            body.extend_from_slice(&id.to_be_bytes());
            body.extend_from_slice(&value.to_be_bytes());
        }
        let mut frame = vec![
            ((body.len() >> 16) & 0xff) as u8,
            ((body.len() >> 8) & 0xff) as u8,
            (body.len() & 0xff) as u8,
            FRAME_SETTINGS,
            0,
        ];
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn preface_plus_settings_frame_is_parsed() {
        let mut payload = PREFACE.to_vec();
        payload.extend_from_slice(&settings_frame(&[(0x1, 4096), (0x3, 100)]));

        let http2 = analyze(&payload).unwrap();
        assert!(http2.has_preface);
        assert_eq!(http2.protocol.as_deref(), Some("HTTP/2"));
        assert_eq!(http2.frames.len(), 1);
        assert_eq!(http2.settings_frames.len(), 1);
        assert_eq!(http2.frames[0].settings.len(), 2);
        assert_eq!(http2.frames[0].settings[0].value, 4096);
    }

    #[test]
    fn headers_frame_counts_toward_total() {
        let mut body = vec![0u8; 5]; // stream dependency + weight
        body.extend_from_slice(b"hpack-fragment");
        let mut frame = vec![
            ((body.len() >> 16) & 0xff) as u8,
            ((body.len() >> 8) & 0xff) as u8,
            (body.len() & 0xff) as u8,
            FRAME_HEADERS,
            0x04, // END_HEADERS
        ];
        frame.extend_from_slice(&1u32.to_be_bytes());
        frame.extend_from_slice(&body);

        let http2 = analyze(&frame).unwrap();
        assert_eq!(http2.total_headers_frames, 1);
        assert_eq!(http2.headers_frames.len(), 1);
        assert_eq!(http2.protocol.as_deref(), Some("HTTP/2 (detected)"));
        assert_eq!(http2.frames[0].header_block_len, Some(b"hpack-fragment".len()));
    }

    #[test]
    fn looks_like_http2_accepts_plausible_frame_header() {
        let frame = [0, 0, 10, 0, 0, 0, 0, 0, 1];
        assert!(looks_like_http2(&frame));
    }

    #[test]
    fn empty_payload_is_an_error() {
        assert_eq!(analyze(&[]).unwrap_err(), AnalyzerError::Empty);
    }
}
