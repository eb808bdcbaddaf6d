//! DNS message decode (spec.md §4.9), RFC 1035 §4.1, including name
//! compression pointers. The source delegates this entirely to a packet
//! decode library; there is no line-for-line original to follow, so this
//! reads the RFC directly.

use std::net::{Ipv4Addr, Ipv6Addr};

use sentry_common::AnalyzerError;
use serde::Serialize;

const MAX_POINTER_HOPS: usize = 16;

/// Start-of-authority record fields.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Soa {
    /// Primary nameserver.
    pub mname: String,
    /// Responsible mailbox.
    pub rname: String,
    /// Zone serial number.
    pub serial: u32,
    /// Refresh interval.
    pub refresh: u32,
    /// Retry interval.
    pub retry: u32,
    /// Expire interval.
    pub expire: u32,
    /// Minimum TTL.
    pub ttl: u32,
}

/// One question entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Question {
    /// Queried name.
    pub name: String,
    /// Record type, e.g. `"A"`, `"AAAA"`, `"CNAME"`.
    pub r#type: String,
    /// Record class, almost always `"IN"`.
    pub class: String,
}

/// One resource record, with a type-specific field populated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Record {
    /// Owner name.
    pub name: String,
    /// Record type name.
    pub r#type: String,
    /// Record class name.
    pub class: String,
    /// Time-to-live in seconds.
    pub ttl: u32,
    /// Dotted-decimal or colon-form address, for A/AAAA records.
    pub ip: Option<String>,
    /// Target name, for NS records.
    pub ns: Option<String>,
    /// Target name, for CNAME records.
    pub cname: Option<String>,
    /// Target name, for PTR records.
    pub ptr: Option<String>,
    /// Character-string segments, for TXT records.
    pub txt: Vec<String>,
    /// Zone parameters, for SOA records.
    pub soa: Option<Soa>,
}

/// A fully decoded DNS message.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Dns {
    /// Transaction id.
    pub id: u16,
    /// True if this is a response.
    pub qr: bool,
    /// Opcode name (`"QUERY"`, `"IQUERY"`, `"STATUS"`, ...).
    pub op_code: String,
    /// Authoritative Answer bit.
    pub aa: bool,
    /// Truncation bit.
    pub tc: bool,
    /// Response code name (`"NOERROR"`, `"NXDOMAIN"`, ...).
    pub response_code: String,
    /// Question section.
    pub questions: Vec<Question>,
    /// Answer section.
    pub answers: Vec<Record>,
    /// Authority section.
    pub authorities: Vec<Record>,
    /// Additional section.
    pub additionals: Vec<Record>,
}

fn type_name(t: u16) -> String {
    match t {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        _ => return format!("TYPE{t}"),
    }
    .to_string()
}

fn class_name(c: u16) -> String {
    match c {
        1 => "IN",
        3 => "CH",
        4 => "HS",
        255 => "ANY",
        _ => return format!("CLASS{c}"),
    }
    .to_string()
}

fn opcode_name(op: u8) -> &'static str {
    match op {
        0 => "QUERY",
        1 => "IQUERY",
        2 => "STATUS",
        _ => "UNKNOWN",
    }
}

fn rcode_name(rc: u8) -> &'static str {
    match rc {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

/// Decode a full DNS message (header + sections) from `payload`.
pub fn analyze(payload: &[u8]) -> Result<Dns, AnalyzerError> {
    if payload.is_empty() {
        return Err(AnalyzerError::Empty);
    }
    if payload.len() < 12 {
        return Err(AnalyzerError::Truncated("DNS header".into()));
    }

    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let qr = flags & 0x8000 != 0;
    let opcode = ((flags >> 11) & 0x0f) as u8;
    let aa = flags & 0x0400 != 0;
    let tc = flags & 0x0200 != 0;
    let rcode = (flags & 0x000f) as u8;

    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    let nscount = u16::from_be_bytes([payload[8], payload[9]]) as usize;
    let arcount = u16::from_be_bytes([payload[10], payload[11]]) as usize;

    let mut pos = 12;
    let mut questions = Vec::with_capacity(qdcount);
    for _ in 0..qdcount {
        let (name, next) = read_name(payload, pos)?;
        if payload.len() < next + 4 {
            return Err(AnalyzerError::Truncated("question".into()));
        }
        let qtype = u16::from_be_bytes([payload[next], payload[next + 1]]);
        let qclass = u16::from_be_bytes([payload[next + 2], payload[next + 3]]);
        questions.push(Question { name, r#type: type_name(qtype), class: class_name(qclass) });
        pos = next + 4;
    }

    let mut answers = Vec::with_capacity(ancount);
    for _ in 0..ancount {
        let (record, next) = read_record(payload, pos)?;
        answers.push(record);
        pos = next;
    }

    let mut authorities = Vec::with_capacity(nscount);
    for _ in 0..nscount {
        let (record, next) = read_record(payload, pos)?;
        authorities.push(record);
        pos = next;
    }

    let mut additionals = Vec::with_capacity(arcount);
    for _ in 0..arcount {
        let (record, next) = read_record(payload, pos)?;
        additionals.push(record);
        pos = next;
    }

    Ok(Dns {
        id,
        qr,
        op_code: opcode_name(opcode).to_string(),
        aa,
        tc,
        response_code: rcode_name(rcode).to_string(),
        questions,
        answers,
        authorities,
        additionals,
    })
}

fn read_record(payload: &[u8], pos: usize) -> Result<(Record, usize), AnalyzerError> {
    let (name, pos) = read_name(payload, pos)?;
    if payload.len() < pos + 10 {
        return Err(AnalyzerError::Truncated("resource record header".into()));
    }
    let rtype = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    let rclass = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]);
    let ttl = u32::from_be_bytes([payload[pos + 4], payload[pos + 5], payload[pos + 6], payload[pos + 7]]);
    let rdlength = u16::from_be_bytes([payload[pos + 8], payload[pos + 9]]) as usize;
    let rdata_start = pos + 10;
    if payload.len() < rdata_start + rdlength {
        return Err(AnalyzerError::Truncated("resource record data".into()));
    }
    let rdata = &payload[rdata_start..rdata_start + rdlength];

    let mut record = Record { name, r#type: type_name(rtype), class: class_name(rclass), ttl, ..Record::default() };

    match rtype {
        1 if rdata.len() == 4 => record.ip = Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string()),
        28 if rdata.len() == 16 => {
            let octets: [u8; 16] = rdata.try_into().unwrap();
            record.ip = Some(Ipv6Addr::from(octets).to_string());
        }
        2 => record.ns = read_name(payload, rdata_start).ok().map(|(n, _)| n),
        5 => record.cname = read_name(payload, rdata_start).ok().map(|(n, _)| n),
        12 => record.ptr = read_name(payload, rdata_start).ok().map(|(n, _)| n),
        16 => record.txt = read_character_strings(rdata),
        6 => record.soa = read_soa(payload, rdata_start).ok(),
        _ => {}
    }

    Ok((record, rdata_start + rdlength))
}

fn read_soa(payload: &[u8], pos: usize) -> Result<Soa, AnalyzerError> {
    let (mname, pos) = read_name(payload, pos)?;
    let (rname, pos) = read_name(payload, pos)?;
    if payload.len() < pos + 20 {
        return Err(AnalyzerError::Truncated("SOA record".into()));
    }
    let word = |off: usize| u32::from_be_bytes(payload[pos + off..pos + off + 4].try_into().unwrap());
    Ok(Soa {
        mname,
        rname,
        serial: word(0),
        refresh: word(4),
        retry: word(8),
        expire: word(12),
        ttl: word(16),
    })
}

fn read_character_strings(mut data: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(&len) = data.first() {
        let len = len as usize;
        if data.len() < 1 + len {
            break;
        }
        out.push(String::from_utf8_lossy(&data[1..1 + len]).into_owned());
        data = &data[1 + len..];
    }
    out
}

/// Read a (possibly compressed) domain name starting at `pos`. Returns the
/// decoded name and the offset immediately after it in the *original*
/// message (not following any pointer).
fn read_name(payload: &[u8], pos: usize) -> Result<(String, usize), AnalyzerError> {
    let mut labels = Vec::new();
    let mut cursor = pos;
    let mut end_of_name: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *payload.get(cursor).ok_or_else(|| AnalyzerError::Truncated("name label length".into()))?;

        if len == 0 {
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 1);
            }
            break;
        }

        if len & 0xc0 == 0xc0 {
            if payload.len() < cursor + 2 {
                return Err(AnalyzerError::Truncated("name pointer".into()));
            }
            if end_of_name.is_none() {
                end_of_name = Some(cursor + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(AnalyzerError::InvalidFormat("DNS name compression loop".into()));
            }
            let offset = (((len & 0x3f) as usize) << 8) | payload[cursor + 1] as usize;
            cursor = offset;
            continue;
        }

        let len = len as usize;
        let label = payload
            .get(cursor + 1..cursor + 1 + len)
            .ok_or_else(|| AnalyzerError::Truncated("name label".into()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor += 1 + len;
    }

    Ok((labels.join("."), end_of_name.unwrap_or(cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_name(name: &str) -> Vec<u8> {
        let mut out = Vec::new();
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out
    }

    fn simple_query(name: &str) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x01, 0x00]; // id, flags: standard query
        msg.extend_from_slice(&1u16.to_be_bytes()); // qdcount
        msg.extend_from_slice(&0u16.to_be_bytes()); // ancount
        msg.extend_from_slice(&0u16.to_be_bytes()); // nscount
        msg.extend_from_slice(&0u16.to_be_bytes()); // arcount
        msg.extend_from_slice(&encode_name(name));
        msg.extend_from_slice(&1u16.to_be_bytes()); // qtype A
        msg.extend_from_slice(&1u16.to_be_bytes()); // qclass IN
        msg
    }

    #[test]
    fn decodes_a_simple_question() {
        let dns = analyze(&simple_query("example.com")).unwrap();
        assert_eq!(dns.id, 0x1234);
        assert!(!dns.qr);
        assert_eq!(dns.questions.len(), 1);
        assert_eq!(dns.questions[0].name, "example.com");
        assert_eq!(dns.questions[0].r#type, "A");
    }

    #[test]
    fn decodes_a_response_with_compressed_answer_name() {
        let mut msg = vec![0x00, 0x01, 0x81, 0x80]; // response, recursion
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes());
        let question_name_offset = msg.len();
        msg.extend_from_slice(&encode_name("example.com"));
        msg.extend_from_slice(&1u16.to_be_bytes());
        msg.extend_from_slice(&1u16.to_be_bytes());

        // Answer: name is a pointer back to the question's name.
        msg.extend_from_slice(&[0xc0, question_name_offset as u8]);
        msg.extend_from_slice(&1u16.to_be_bytes()); // type A
        msg.extend_from_slice(&1u16.to_be_bytes()); // class IN
        msg.extend_from_slice(&300u32.to_be_bytes()); // ttl
        msg.extend_from_slice(&4u16.to_be_bytes()); // rdlength
        msg.extend_from_slice(&[93, 184, 216, 34]); // example.com's A record-ish

        let dns = analyze(&msg).unwrap();
        assert_eq!(dns.answers.len(), 1);
        assert_eq!(dns.answers[0].name, "example.com");
        assert_eq!(dns.answers[0].ip.as_deref(), Some("93.184.216.34"));
    }

    #[test]
    fn truncated_header_is_an_error() {
        assert!(matches!(analyze(&[0; 4]), Err(AnalyzerError::Truncated(_))));
    }
}
