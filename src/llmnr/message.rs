//! LLMNR message format (RFC 4795 §2.1), carried in DNS wire format.

use crate::error::{Error, WireError};
use crate::helpers::{ipv4_to_rdata, ipv6_to_rdata};
use crate::wire::{self, read_u16, read_u32, HEADER_SIZE};
use bytes::BufMut;
use std::fmt;

// Header flag bits
pub const FLAG_QR: u16 = 0x8000; // Query/Response flag
pub const FLAG_OPCODE_MASK: u16 = 0x7800;
pub const FLAG_C: u16 = 0x0400; // Conflict
pub const FLAG_TC: u16 = 0x0200; // Truncation
pub const FLAG_T: u16 = 0x0100; // Tentative
pub const FLAG_RCODE_MASK: u16 = 0x000F;

/// TTL used for answers built by the A/AAAA helpers
pub const DEFAULT_ANSWER_TTL: u32 = 30;

// Record type values
const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_SOA: u16 = 6;
const TYPE_PTR: u16 = 12;
const TYPE_MX: u16 = 15;
const TYPE_TXT: u16 = 16;
const TYPE_AAAA: u16 = 28;
const TYPE_SRV: u16 = 33;
const TYPE_OPT: u16 = 41;
const TYPE_AXFR: u16 = 252;
const TYPE_ALL: u16 = 255;

// Class values
const CLASS_IN: u16 = 1;
const CLASS_CS: u16 = 2;
const CLASS_CH: u16 = 3;
const CLASS_HS: u16 = 4;
const CLASS_NONE: u16 = 254;
const CLASS_ANY: u16 = 255;
const CLASS_UNICAST: u16 = 0x8001;

/// Record types recognized by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    OPT,
    AXFR,
    ALL,
    Other(u16),
}

impl RecordType {
    /// Create from raw type value
    pub fn from_u16(value: u16) -> Self {
        match value {
            TYPE_A => RecordType::A,
            TYPE_NS => RecordType::NS,
            TYPE_CNAME => RecordType::CNAME,
            TYPE_SOA => RecordType::SOA,
            TYPE_PTR => RecordType::PTR,
            TYPE_MX => RecordType::MX,
            TYPE_TXT => RecordType::TXT,
            TYPE_AAAA => RecordType::AAAA,
            TYPE_SRV => RecordType::SRV,
            TYPE_OPT => RecordType::OPT,
            TYPE_AXFR => RecordType::AXFR,
            TYPE_ALL => RecordType::ALL,
            other => RecordType::Other(other),
        }
    }

    /// Convert to raw type value
    pub fn to_u16(self) -> u16 {
        match self {
            RecordType::A => TYPE_A,
            RecordType::NS => TYPE_NS,
            RecordType::CNAME => TYPE_CNAME,
            RecordType::SOA => TYPE_SOA,
            RecordType::PTR => TYPE_PTR,
            RecordType::MX => TYPE_MX,
            RecordType::TXT => TYPE_TXT,
            RecordType::AAAA => TYPE_AAAA,
            RecordType::SRV => TYPE_SRV,
            RecordType::OPT => TYPE_OPT,
            RecordType::AXFR => TYPE_AXFR,
            RecordType::ALL => TYPE_ALL,
            RecordType::Other(v) => v,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::MX => write!(f, "MX"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::AXFR => write!(f, "AXFR"),
            RecordType::ALL => write!(f, "ALL"),
            RecordType::Other(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// Record classes recognized by the codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum Class {
    IN,
    CS,
    CH,
    HS,
    NONE,
    ANY,
    UNICAST,
    Other(u16),
}

impl Class {
    pub fn from_u16(value: u16) -> Self {
        match value {
            CLASS_IN => Class::IN,
            CLASS_CS => Class::CS,
            CLASS_CH => Class::CH,
            CLASS_HS => Class::HS,
            CLASS_NONE => Class::NONE,
            CLASS_ANY => Class::ANY,
            CLASS_UNICAST => Class::UNICAST,
            other => Class::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Class::IN => CLASS_IN,
            Class::CS => CLASS_CS,
            Class::CH => CLASS_CH,
            Class::HS => CLASS_HS,
            Class::NONE => CLASS_NONE,
            Class::ANY => CLASS_ANY,
            Class::UNICAST => CLASS_UNICAST,
            Class::Other(v) => v,
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Class::IN => write!(f, "IN"),
            Class::CS => write!(f, "CS"),
            Class::CH => write!(f, "CH"),
            Class::HS => write!(f, "HS"),
            Class::NONE => write!(f, "NONE"),
            Class::ANY => write!(f, "ANY"),
            Class::UNICAST => write!(f, "UNICAST"),
            Class::Other(v) => write!(f, "CLASS{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub class: Class,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType, class: Class) -> Self {
        Question {
            name: name.to_string(),
            qtype,
            class,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: Class,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A decoded LLMNR message. Section counts are not stored; they are
/// always derived from the section lengths when encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// A standard query with a single IN question
    pub fn new_query(id: u16, name: &str, qtype: RecordType) -> Self {
        Message {
            id,
            questions: vec![Question::new(name, qtype, Class::IN)],
            ..Default::default()
        }
    }

    /// Empty response to `request`: same ID and opcode, QR set, no sections
    pub fn new_response(request: &Message) -> Self {
        Message {
            id: request.id,
            flags: (request.flags & FLAG_OPCODE_MASK) | FLAG_QR,
            ..Default::default()
        }
    }

    pub fn is_query(&self) -> bool {
        self.flags & FLAG_QR == 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// Mark as a response (QR=1)
    pub fn set_response(&mut self) {
        self.flags |= FLAG_QR;
    }

    /// 4-bit opcode (0 = standard query)
    pub fn opcode(&self) -> u8 {
        ((self.flags & FLAG_OPCODE_MASK) >> 11) as u8
    }

    pub fn conflict(&self) -> bool {
        self.flags & FLAG_C != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn tentative(&self) -> bool {
        self.flags & FLAG_T != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & FLAG_RCODE_MASK) as u8
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.flags = (self.flags & !FLAG_RCODE_MASK) | (u16::from(rcode) & FLAG_RCODE_MASK);
    }

    /// Append an IN/A answer for `name` with TTL 30, adding the matching
    /// question if the message does not already carry it.
    pub fn add_answer_in_a(&mut self, name: &str, ipv4: &str) -> Result<(), Error> {
        let rdata = ipv4_to_rdata(ipv4).ok_or_else(|| Error::InvalidAddress(ipv4.to_string()))?;
        self.add_address_answer(name, RecordType::A, rdata.to_vec());
        Ok(())
    }

    /// Append an IN/AAAA answer for `name` with TTL 30, adding the matching
    /// question if the message does not already carry it.
    pub fn add_answer_in_aaaa(&mut self, name: &str, ipv6: &str) -> Result<(), Error> {
        let rdata = ipv6_to_rdata(ipv6).ok_or_else(|| Error::InvalidAddress(ipv6.to_string()))?;
        self.add_address_answer(name, RecordType::AAAA, rdata.to_vec());
        Ok(())
    }

    fn add_address_answer(&mut self, name: &str, rtype: RecordType, rdata: Vec<u8>) {
        let asked = self
            .questions
            .iter()
            .any(|q| q.name == name && q.qtype == rtype && q.class == Class::IN);
        if !asked {
            self.questions.push(Question::new(name, rtype, Class::IN));
        }
        self.answers.push(ResourceRecord {
            name: name.to_string(),
            rtype,
            class: Class::IN,
            ttl: DEFAULT_ANSWER_TTL,
            rdata,
        });
    }

    /// Serialize to wire format. Counts are recomputed from the sections.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(512);
        buf.put_u16(self.id);
        buf.put_u16(self.flags);
        buf.put_u16(section_count(self.questions.len())?);
        buf.put_u16(section_count(self.answers.len())?);
        buf.put_u16(section_count(self.authority.len())?);
        buf.put_u16(section_count(self.additional.len())?);

        for q in &self.questions {
            wire::write_name(&mut buf, &q.name)?;
            buf.put_u16(q.qtype.to_u16());
            buf.put_u16(q.class.to_u16());
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            write_record(&mut buf, rr)?;
        }
        Ok(buf)
    }

    /// Parse a complete message. Any truncation is an error.
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader);
        }
        let field = |pos| read_u16(buf, pos).ok_or(WireError::TruncatedHeader);
        let id = field(0)?;
        let flags = field(2)?;
        let qdcount = field(4)?;
        let ancount = field(6)?;
        let nscount = field(8)?;
        let arcount = field(10)?;

        let mut pos = HEADER_SIZE;

        let mut questions = Vec::with_capacity(usize::from(qdcount).min(16));
        for _ in 0..qdcount {
            let (name, next) = wire::decode_name(buf, pos)?;
            let qtype = read_u16(buf, next).ok_or(WireError::TruncatedQuestion)?;
            let class = read_u16(buf, next + 2).ok_or(WireError::TruncatedQuestion)?;
            questions.push(Question {
                name,
                qtype: RecordType::from_u16(qtype),
                class: Class::from_u16(class),
            });
            pos = next + 4;
        }

        let answers = read_records(buf, &mut pos, ancount)?;
        let authority = read_records(buf, &mut pos, nscount)?;
        let additional = read_records(buf, &mut pos, arcount)?;

        Ok(Message {
            id,
            flags,
            questions,
            answers,
            authority,
            additional,
        })
    }

    /// Human-readable dump, one line per header field and record
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![
            format!("id: 0x{:04x}", self.id),
            format!(
                "flags: 0x{:04x} ({}, opcode {}, rcode {}{}{}{})",
                self.flags,
                if self.is_response() { "response" } else { "query" },
                self.opcode(),
                self.rcode(),
                if self.conflict() { ", C" } else { "" },
                if self.truncated() { ", TC" } else { "" },
                if self.tentative() { ", T" } else { "" },
            ),
        ];
        for q in &self.questions {
            lines.push(format!("question: {} {} {}", q.name, q.qtype, q.class));
        }
        for (section, records) in [
            ("answer", &self.answers),
            ("authority", &self.authority),
            ("additional", &self.additional),
        ] {
            for rr in records {
                lines.push(format!(
                    "{}: {} {} {} ttl={} rdata={}",
                    section,
                    rr.name,
                    rr.rtype,
                    rr.class,
                    rr.ttl,
                    describe_rdata(rr)
                ));
            }
        }
        lines
    }
}

fn section_count(len: usize) -> Result<u16, WireError> {
    u16::try_from(len).map_err(|_| WireError::TruncatedRecord)
}

fn write_record(buf: &mut Vec<u8>, rr: &ResourceRecord) -> Result<(), WireError> {
    let rdlength = u16::try_from(rr.rdata.len()).map_err(|_| WireError::TruncatedRecord)?;
    wire::write_name(buf, &rr.name)?;
    buf.put_u16(rr.rtype.to_u16());
    buf.put_u16(rr.class.to_u16());
    buf.put_u32(rr.ttl);
    buf.put_u16(rdlength);
    buf.put_slice(&rr.rdata);
    Ok(())
}

fn read_records(
    buf: &[u8],
    pos: &mut usize,
    count: u16,
) -> Result<Vec<ResourceRecord>, WireError> {
    let mut records = Vec::with_capacity(usize::from(count).min(16));
    for _ in 0..count {
        let (name, next) = wire::decode_name(buf, *pos)?;
        let rtype = read_u16(buf, next).ok_or(WireError::TruncatedRecord)?;
        let class = read_u16(buf, next + 2).ok_or(WireError::TruncatedRecord)?;
        let ttl = read_u32(buf, next + 4).ok_or(WireError::TruncatedRecord)?;
        let rdlength = usize::from(read_u16(buf, next + 8).ok_or(WireError::TruncatedRecord)?);
        let rdata_start = next + 10;
        let rdata = buf
            .get(rdata_start..rdata_start + rdlength)
            .ok_or(WireError::TruncatedRecord)?;
        records.push(ResourceRecord {
            name,
            rtype: RecordType::from_u16(rtype),
            class: Class::from_u16(class),
            ttl,
            rdata: rdata.to_vec(),
        });
        *pos = rdata_start + rdlength;
    }
    Ok(records)
}

fn describe_rdata(rr: &ResourceRecord) -> String {
    match (rr.rtype, rr.rdata.len()) {
        (RecordType::A, 4) => {
            let octets: [u8; 4] = [rr.rdata[0], rr.rdata[1], rr.rdata[2], rr.rdata[3]];
            std::net::Ipv4Addr::from(octets).to_string()
        }
        (RecordType::AAAA, 16) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rr.rdata);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => rr.rdata.iter().map(|b| format!("{:02x}", b)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_conversions() {
        assert_eq!(RecordType::from_u16(1), RecordType::A);
        assert_eq!(RecordType::from_u16(28), RecordType::AAAA);
        assert_eq!(RecordType::from_u16(33), RecordType::SRV);
        assert_eq!(RecordType::from_u16(999), RecordType::Other(999));
        assert_eq!(RecordType::ALL.to_u16(), 255);
        assert_eq!(RecordType::Other(999).to_u16(), 999);
        assert_eq!(format!("{}", RecordType::Other(99)), "TYPE99");
    }

    #[test]
    fn test_class_conversions() {
        assert_eq!(Class::from_u16(1), Class::IN);
        assert_eq!(Class::from_u16(0x8001), Class::UNICAST);
        assert_eq!(Class::NONE.to_u16(), 254);
        assert_eq!(Class::from_u16(77), Class::Other(77));
    }

    #[test]
    fn test_query_encoding() {
        let msg = Message::new_query(0x1234, "host", RecordType::A);
        let bytes = msg.encode().unwrap();
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        assert_eq!(&bytes[2..4], &[0, 0]);
        assert_eq!(&bytes[4..6], &[0, 1]); // QDCOUNT
        assert_eq!(&bytes[6..12], &[0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[12..18], &[4, b'h', b'o', b's', b't', 0]);
        assert_eq!(&bytes[18..22], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_counts_follow_sections() {
        let mut msg = Message::new_query(7, "a.b", RecordType::A);
        msg.add_answer_in_a("a.b", "10.0.0.1").unwrap();
        msg.authority.push(ResourceRecord {
            name: "ns".into(),
            rtype: RecordType::NS,
            class: Class::IN,
            ttl: 60,
            rdata: vec![1, b'x', 0],
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(read_u16(&bytes, 4), Some(1));
        assert_eq!(read_u16(&bytes, 6), Some(1));
        assert_eq!(read_u16(&bytes, 8), Some(1));
        assert_eq!(read_u16(&bytes, 10), Some(0));
    }

    #[test]
    fn test_message_roundtrip_all_sections() {
        let mut msg = Message::new_query(0xBEEF, "printer.local", RecordType::AAAA);
        msg.set_response();
        msg.add_answer_in_aaaa("printer.local", "fe80::1").unwrap();
        msg.additional.push(ResourceRecord {
            name: "printer.local".into(),
            rtype: RecordType::TXT,
            class: Class::IN,
            ttl: 120,
            rdata: b"\x05hello".to_vec(),
        });

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.is_response());
        assert_eq!(decoded.answers[0].rdata.len(), 16);
    }

    #[test]
    fn test_add_answer_in_a() {
        let mut msg = Message::default();
        msg.add_answer_in_a("host.local", "192.168.1.1").unwrap();
        msg.add_answer_in_a("host.local", "192.168.1.2").unwrap();

        assert_eq!(msg.questions.len(), 1);
        assert_eq!(msg.questions[0].qtype, RecordType::A);
        assert_eq!(msg.answers.len(), 2);
        assert_eq!(msg.answers[0].ttl, 30);
        assert_eq!(msg.answers[0].rdata, vec![192, 168, 1, 1]);
    }

    #[test]
    fn test_add_answer_rejects_bad_address() {
        let mut msg = Message::default();
        assert!(matches!(
            msg.add_answer_in_a("h", "fe80::1"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            msg.add_answer_in_aaaa("h", "not-an-ip"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(msg.questions.is_empty());
        assert!(msg.answers.is_empty());
    }

    #[test]
    fn test_new_response_copies_id() {
        let mut query = Message::new_query(42, "x", RecordType::A);
        query.flags |= FLAG_T;
        let response = Message::new_response(&query);
        assert_eq!(response.id, 42);
        assert!(response.is_response());
        assert!(!response.tentative());
        assert!(response.questions.is_empty());
    }

    #[test]
    fn test_flag_accessors() {
        let mut msg = Message {
            flags: FLAG_QR | FLAG_C | FLAG_TC | FLAG_T | (3 << 11),
            ..Default::default()
        };
        assert!(msg.conflict());
        assert!(msg.truncated());
        assert!(msg.tentative());
        assert_eq!(msg.opcode(), 3);
        msg.set_rcode(5);
        assert_eq!(msg.rcode(), 5);
        assert_eq!(msg.opcode(), 3);
    }

    #[test]
    fn test_decode_short_header() {
        assert_eq!(Message::decode(&[0; 11]), Err(WireError::TruncatedHeader));
    }

    #[test]
    fn test_decode_truncated_question() {
        let bytes = Message::new_query(1, "host", RecordType::A).encode().unwrap();
        let cut = &bytes[..bytes.len() - 2];
        assert_eq!(Message::decode(cut), Err(WireError::TruncatedQuestion));
    }

    #[test]
    fn test_decode_truncated_rdata() {
        let mut msg = Message::default();
        msg.add_answer_in_a("h", "1.2.3.4").unwrap();
        let bytes = msg.encode().unwrap();
        let cut = &bytes[..bytes.len() - 1];
        assert_eq!(Message::decode(cut), Err(WireError::TruncatedRecord));
    }

    #[test]
    fn test_decode_count_exceeds_data() {
        let mut bytes = Message::new_query(1, "host", RecordType::A).encode().unwrap();
        bytes[5] = 2; // claims two questions
        assert_eq!(Message::decode(&bytes), Err(WireError::TruncatedName));
    }

    #[test]
    fn test_decode_compressed_answer_name() {
        let mut bytes = Message::new_query(9, "host.local", RecordType::A)
            .encode()
            .unwrap();
        bytes[2] = 0x80; // QR
        bytes[7] = 1; // ANCOUNT
        bytes.extend_from_slice(&[0xC0, 12, 0, 1, 0, 1, 0, 0, 0, 30, 0, 4, 10, 0, 0, 1]);
        let msg = Message::decode(&bytes).unwrap();
        assert_eq!(msg.answers[0].name, "host.local");
        assert_eq!(msg.answers[0].rdata, vec![10, 0, 0, 1]);
    }

    #[test]
    fn test_encode_rejects_long_label() {
        let msg = Message::new_query(1, &"a".repeat(64), RecordType::A);
        assert_eq!(msg.encode(), Err(WireError::LabelTooLong));
    }

    #[test]
    fn test_describe() {
        let mut msg = Message::new_query(1, "host", RecordType::A);
        msg.add_answer_in_a("host", "10.1.2.3").unwrap();
        let lines = msg.describe();
        assert_eq!(lines[0], "id: 0x0001");
        assert!(lines.iter().any(|l| l == "question: host A IN"));
        assert!(lines.iter().any(|l| l.contains("ttl=30 rdata=10.1.2.3")));
    }
}
