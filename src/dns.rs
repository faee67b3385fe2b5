//! DNS message parsing and construction.
//!
//! Only the parts the masquerading path needs: the header, the first
//! question, and synthesized responses. Everything else is relayed as
//! opaque bytes.

use std::net::IpAddr;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

pub const OPCODE_QUERY: u8 = 0;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NOTIMP: u8 = 4;

/// TTL handed out for masqueraded answers.
pub const LOCAL_TTL: u32 = 60;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

const MAX_NAME_LEN: usize = 255;

/// Read the transaction ID of a message.
pub fn transaction_id(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

/// Fixed 12-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let word = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

        Some(Self {
            id: word(0),
            flags: word(2),
            qdcount: word(4),
            ancount: word(6),
            nscount: word(8),
            arcount: word(10),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn is_truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags & OPCODE_MASK) >> 11) as u8
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }

    /// Flags for a reply to a query carrying `self.flags`.
    ///
    /// Echoes opcode and RD, sets QR and RA.
    fn reply_flags(&self, rcode: u8, authoritative: bool) -> u16 {
        let mut flags = FLAG_QR | FLAG_RA | (self.flags & (OPCODE_MASK | FLAG_RD));
        if authoritative {
            flags |= FLAG_AA;
        }
        flags | (rcode as u16 & 0x000F)
    }
}

/// A decoded single-question DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub header: Header,
    /// Queried name, lower-cased, without the trailing dot.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Offset one past the end of the question section.
    pub question_end: usize,
}

impl DnsQuery {
    /// Decode the header and the question of a query.
    ///
    /// Returns `None` unless the message carries exactly one well-formed
    /// question. Compression pointers are not valid inside a query's
    /// question and are rejected.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = Header::parse(data)?;
        if header.qdcount != 1 {
            return None;
        }

        let mut pos = HEADER_LEN;
        let mut labels: Vec<String> = Vec::new();
        let mut wire_len = 1;

        loop {
            let label_len = *data.get(pos)? as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            if label_len & 0xC0 != 0 {
                return None;
            }
            let label = data.get(pos..pos + label_len)?;
            wire_len += label_len + 1;
            if wire_len > MAX_NAME_LEN {
                return None;
            }
            labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
            pos += label_len;
        }

        let fixed = data.get(pos..pos + 4)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Some(Self {
            header,
            domain: labels.join("."),
            qtype,
            qclass,
            question_end: pos + 4,
        })
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }
}

/// A resource record in a synthesized answer.
///
/// The owner name is always the question name, written as a pointer.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn address(addr: IpAddr, ttl: u32) -> Self {
        match addr {
            IpAddr::V4(v4) => Self {
                rtype: TYPE_A,
                class: CLASS_IN,
                ttl,
                rdata: v4.octets().to_vec(),
            },
            IpAddr::V6(v6) => Self {
                rtype: TYPE_AAAA,
                class: CLASS_IN,
                ttl,
                rdata: v6.octets().to_vec(),
            },
        }
    }
}

/// A response built locally instead of relayed from upstream.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    /// Raw question section copied from the query, possibly empty.
    pub question: Vec<u8>,
    pub answers: Vec<DnsRecord>,
}

impl DnsResponse {
    /// Authoritative answer carrying the override address.
    pub fn masqueraded(query: &DnsQuery, raw: &[u8], addr: IpAddr) -> Self {
        Self {
            id: query.id(),
            flags: query.header.reply_flags(RCODE_NOERROR, true),
            question: raw[HEADER_LEN..query.question_end].to_vec(),
            answers: vec![DnsRecord::address(addr, LOCAL_TTL)],
        }
    }

    /// Error reply echoing the question when one was decoded.
    pub fn error(header: &Header, question: &[u8], rcode: u8) -> Self {
        Self {
            id: header.id,
            flags: header.reply_flags(rcode, false),
            question: question.to_vec(),
            answers: Vec::new(),
        }
    }

    /// SERVFAIL for a decoded query.
    pub fn server_failure(query: &DnsQuery, raw: &[u8]) -> Self {
        Self::error(
            &query.header,
            &raw[HEADER_LEN..query.question_end],
            RCODE_SERVFAIL,
        )
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.question.len() + 32);
        let qdcount: u16 = if self.question.is_empty() { 0 } else { 1 };

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&qdcount.to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT
        data.extend_from_slice(&self.question);

        for a in &self.answers {
            data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to the question name
            data.extend_from_slice(&a.rtype.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

/// Build a standard recursive query for `domain`.
pub fn encode_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + domain.len() + 6);

    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAG_RD.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    packet.extend_from_slice(&[0x00; 6]);
    encode_domain(&mut packet, domain);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    packet
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() {
            continue;
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Extract the addresses of all A/AAAA answers in a response.
///
/// Only follows the simple layout this crate and typical resolvers produce;
/// used for logging and tests, never for relaying.
pub fn answer_addresses(response: &[u8]) -> Vec<IpAddr> {
    let Some(header) = Header::parse(response) else {
        return Vec::new();
    };

    let mut pos = HEADER_LEN;
    for _ in 0..header.qdcount {
        match skip_name(response, pos) {
            Some(p) => pos = p + 4,
            None => return Vec::new(),
        }
    }

    let mut addrs = Vec::new();
    for _ in 0..header.ancount {
        let Some(p) = skip_name(response, pos) else {
            break;
        };
        pos = p;
        let Some(fixed) = response.get(pos..pos + 10) else {
            break;
        };
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        pos += 10;
        let Some(rdata) = response.get(pos..pos + rdlength) else {
            break;
        };
        match (rtype, rdlength) {
            (TYPE_A, 4) => addrs.push(IpAddr::from([rdata[0], rdata[1], rdata[2], rdata[3]])),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::from(octets));
            }
            _ => {}
        }
        pos += rdlength;
    }

    addrs
}

fn skip_name(data: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let b = *data.get(pos)?;
        if b == 0 {
            return Some(pos + 1);
        }
        if b & 0xC0 == 0xC0 {
            return Some(pos + 2);
        }
        pos += 1 + b as usize;
    }
}
