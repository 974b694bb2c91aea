//! DNS wire codec for the interception proxy.
//!
//! Parses just enough of a query datagram to make a block/forward decision
//! (transaction ID, first question) and synthesizes deterministic answers
//! from the original query bytes. Forwarded traffic is never re-encoded, so
//! upstream answers pass through byte-for-byte.

use thiserror::Error;

/// A record (IPv4 address).
pub const QTYPE_A: u16 = 1;
/// AAAA record (IPv6 address).
pub const QTYPE_AAAA: u16 = 28;

/// Name error: the domain does not exist.
pub const RCODE_NXDOMAIN: u8 = 3;
/// Server failure: the proxy could not get an answer.
pub const RCODE_SERVFAIL: u8 = 2;

/// TTL for synthesized block answers. Kept short so lifting a block takes
/// effect quickly on cached clients.
pub const SINKHOLE_TTL: u32 = 10;

/// Upper bound on compression-pointer jumps while decoding a name.
const MAX_POINTER_JUMPS: usize = 16;

/// The first question of a DNS query datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Transaction ID, copied through to every answer.
    pub id: u16,
    /// Queried domain, dot-joined, as it appeared on the wire.
    pub name: String,
    /// Query type (A = 1, AAAA = 28, ...).
    pub qtype: u16,
    /// Query class (IN = 1).
    pub qclass: u16,
    /// Byte length of header + first question; synthesized answers echo
    /// exactly this prefix of the query.
    pub question_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("datagram too short for a DNS header")]
    TooShort,

    #[error("truncated DNS datagram")]
    Truncated,

    #[error("invalid name compression pointer")]
    InvalidPointer,

    #[error("datagram is a response, not a query")]
    NotAQuery,

    #[error("query carries no question")]
    NoQuestion,
}

/// Parses the first question of a query datagram.
pub fn parse_question(datagram: &[u8]) -> Result<DnsQuestion, WireError> {
    if datagram.len() < 12 {
        return Err(WireError::TooShort);
    }

    let id = u16::from_be_bytes([datagram[0], datagram[1]]);
    let flags = u16::from_be_bytes([datagram[2], datagram[3]]);
    if flags >> 15 == 1 {
        return Err(WireError::NotAQuery);
    }

    let qdcount = u16::from_be_bytes([datagram[4], datagram[5]]);
    if qdcount == 0 {
        return Err(WireError::NoQuestion);
    }

    let (name, mut pos) = parse_name(datagram, 12)?;
    if pos + 4 > datagram.len() {
        return Err(WireError::Truncated);
    }
    let qtype = u16::from_be_bytes([datagram[pos], datagram[pos + 1]]);
    pos += 2;
    let qclass = u16::from_be_bytes([datagram[pos], datagram[pos + 1]]);
    pos += 2;

    Ok(DnsQuestion {
        id,
        name,
        qtype,
        qclass,
        question_end: pos,
    })
}

/// Decodes a domain name, following compression pointers.
fn parse_name(data: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut parts = Vec::new();
    let mut pos = offset;
    let mut jumped = false;
    let mut jump_return = offset;
    let mut jumps = 0;

    loop {
        if pos >= data.len() {
            return Err(WireError::Truncated);
        }

        let label_len = data[pos];

        // Compression pointer (11xxxxxx)
        if label_len & 0xC0 == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(WireError::Truncated);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(WireError::InvalidPointer);
            }
            let pointer = u16::from_be_bytes([data[pos] & 0x3F, data[pos + 1]]) as usize;
            if pointer >= data.len() {
                return Err(WireError::InvalidPointer);
            }
            if !jumped {
                jump_return = pos + 2;
            }
            pos = pointer;
            jumped = true;
            continue;
        }

        // Null label ends the name
        if label_len == 0 {
            pos += 1;
            break;
        }

        pos += 1;
        if pos + label_len as usize > data.len() {
            return Err(WireError::Truncated);
        }
        parts.push(String::from_utf8_lossy(&data[pos..pos + label_len as usize]).to_string());
        pos += label_len as usize;
    }

    let end = if jumped { jump_return } else { pos };
    Ok((parts.join("."), end))
}

/// Builds a response that echoes the query's question section.
///
/// The header keeps the query's opcode and RD flag, sets QR and RA, and
/// zeroes every record count except the question and `ancount`.
fn build_response(query: &[u8], question: &DnsQuestion, rcode: u8, ancount: u16) -> Vec<u8> {
    let mut out = query[..question.question_end].to_vec();

    let query_flags = u16::from_be_bytes([query[2], query[3]]);
    let flags = 0x8000 // QR: response
        | (query_flags & 0x7800) // opcode
        | (query_flags & 0x0100) // RD
        | 0x0080 // RA
        | rcode as u16;
    out[2..4].copy_from_slice(&flags.to_be_bytes());
    out[4..6].copy_from_slice(&1u16.to_be_bytes()); // qdcount
    out[6..8].copy_from_slice(&ancount.to_be_bytes());
    out[8..10].copy_from_slice(&0u16.to_be_bytes()); // nscount
    out[10..12].copy_from_slice(&0u16.to_be_bytes()); // arcount
    out
}

/// Synthesizes an NXDOMAIN answer for a blocked query.
pub fn synthesize_nxdomain(query: &[u8], question: &DnsQuestion) -> Vec<u8> {
    build_response(query, question, RCODE_NXDOMAIN, 0)
}

/// Synthesizes a SERVFAIL answer when upstream could not be reached.
pub fn synthesize_servfail(query: &[u8], question: &DnsQuestion) -> Vec<u8> {
    build_response(query, question, RCODE_SERVFAIL, 0)
}

/// Synthesizes a sinkhole answer for a blocked address query.
///
/// A queries resolve to 0.0.0.0 and AAAA queries to ::, both non-routable,
/// so the client fails immediately instead of retrying other resolvers.
pub fn synthesize_sinkhole(query: &[u8], question: &DnsQuestion) -> Vec<u8> {
    let rdata: &[u8] = match question.qtype {
        QTYPE_A => &[0, 0, 0, 0],
        QTYPE_AAAA => &[0u8; 16],
        _ => return synthesize_nxdomain(query, question),
    };

    let mut out = build_response(query, question, 0, 1);
    // Answer record: pointer to the question name at offset 12.
    out.extend_from_slice(&[0xC0, 0x0C]);
    out.extend_from_slice(&question.qtype.to_be_bytes());
    out.extend_from_slice(&question.qclass.to_be_bytes());
    out.extend_from_slice(&SINKHOLE_TTL.to_be_bytes());
    out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    out.extend_from_slice(rdata);
    out
}
