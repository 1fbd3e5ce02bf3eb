//! NBNS packet codec (RFC 1002 §4.2).

use crate::error::WireError;
use crate::helpers::rdata_to_ipv4;
use crate::nbns::name::NetBiosName;
use crate::wire::{read_u16, read_u32, HEADER_SIZE};
use bytes::BufMut;
use std::fmt;
use std::net::Ipv4Addr;

// Header flag bits
pub const FLAG_RESPONSE: u16 = 0x8000;
pub const OPCODE_MASK: u16 = 0x7800;
pub const FLAG_AUTHORITATIVE: u16 = 0x0400;
pub const FLAG_TRUNCATED: u16 = 0x0200;
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// Set in a response whose answers belong to a group name
pub const FLAG_GROUP: u16 = 0x0080;
pub const FLAG_BROADCAST: u16 = 0x0010;
pub const RCODE_MASK: u16 = 0x000F;

/// NB (general name service) record type
pub const TYPE_NB: u16 = 0x0020;
/// NBSTAT (node status) record type
pub const TYPE_NBSTAT: u16 = 0x0021;
/// Internet class
pub const CLASS_IN: u16 = 0x0001;

/// Group bit in the NB_FLAGS word of 6-byte RDATA
const NB_FLAG_GROUP: u16 = 0x8000;

/// Opcodes carried in bits 11..14 of the flags word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    Registration,
    Release,
    Wack,
    Refresh,
    Redirect,
    Conflict,
    MultiHomedRegistration,
    Other(u16),
}

impl Opcode {
    pub fn from_flags(flags: u16) -> Self {
        match flags & OPCODE_MASK {
            0x0000 => Opcode::Query,
            0x2800 => Opcode::Registration,
            0x3000 => Opcode::Release,
            0x3800 => Opcode::Wack,
            0x4000 => Opcode::Refresh,
            0x4800 => Opcode::Redirect,
            0x5000 => Opcode::Conflict,
            0x7800 => Opcode::MultiHomedRegistration,
            other => Opcode::Other(other),
        }
    }

    /// Bits to OR into the flags word
    pub fn bits(self) -> u16 {
        match self {
            Opcode::Query => 0x0000,
            Opcode::Registration => 0x2800,
            Opcode::Release => 0x3000,
            Opcode::Wack => 0x3800,
            Opcode::Refresh => 0x4000,
            Opcode::Redirect => 0x4800,
            Opcode::Conflict => 0x5000,
            Opcode::MultiHomedRegistration => 0x7800,
            Opcode::Other(bits) => bits & OPCODE_MASK,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Query => write!(f, "query"),
            Opcode::Registration => write!(f, "registration"),
            Opcode::Release => write!(f, "release"),
            Opcode::Wack => write!(f, "wack"),
            Opcode::Refresh => write!(f, "refresh"),
            Opcode::Redirect => write!(f, "redirect"),
            Opcode::Conflict => write!(f, "conflict"),
            Opcode::MultiHomedRegistration => write!(f, "multi-homed registration"),
            Opcode::Other(bits) => write!(f, "opcode 0x{:04x}", bits),
        }
    }
}

/// Response codes in the low four bits of the flags word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    Success = 0,
    FormatError = 1,
    ServerError = 2,
    NameError = 3,
    NotImplemented = 4,
    Refused = 5,
    Active = 6,
    Conflict = 7,
}

impl Rcode {
    pub fn from_flags(flags: u16) -> Option<Self> {
        match flags & RCODE_MASK {
            0 => Some(Rcode::Success),
            1 => Some(Rcode::FormatError),
            2 => Some(Rcode::ServerError),
            3 => Some(Rcode::NameError),
            4 => Some(Rcode::NotImplemented),
            5 => Some(Rcode::Refused),
            6 => Some(Rcode::Active),
            7 => Some(Rcode::Conflict),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: NetBiosName,
    pub qtype: u16,
    pub class: u16,
}

impl Question {
    /// NB/IN question for `name`
    pub fn nb(name: NetBiosName) -> Self {
        Question {
            name,
            qtype: TYPE_NB,
            class: CLASS_IN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: NetBiosName,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    /// NB/IN record with 4-byte address RDATA
    pub fn nb(name: NetBiosName, ttl: u32, addr: Ipv4Addr) -> Self {
        ResourceRecord {
            name,
            rtype: TYPE_NB,
            class: CLASS_IN,
            ttl,
            rdata: addr.octets().to_vec(),
        }
    }

    /// Owner address from NB RDATA: either the bare 4-byte address or the
    /// 6-byte NB_FLAGS + address form
    pub fn address(&self) -> Result<Ipv4Addr, WireError> {
        let octets = match self.rdata.len() {
            6 => &self.rdata[2..],
            _ => &self.rdata[..],
        };
        rdata_to_ipv4(octets).ok_or(WireError::InvalidRdata)
    }

    /// Group bit from 6-byte RDATA; `None` for the bare address form
    pub fn nb_group_flag(&self) -> Option<bool> {
        (self.rdata.len() == 6)
            .then(|| u16::from_be_bytes([self.rdata[0], self.rdata[1]]) & NB_FLAG_GROUP != 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub transaction_id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Packet {
    /// Unicast name query with a single NB question
    pub fn new_query(transaction_id: u16, name: NetBiosName) -> Self {
        Packet {
            transaction_id,
            questions: vec![Question::nb(name)],
            ..Default::default()
        }
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_flags(self.flags)
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    pub fn is_group(&self) -> bool {
        self.flags & FLAG_GROUP != 0
    }

    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }

    /// Replace the response code
    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.flags = (self.flags & !RCODE_MASK) | rcode as u16;
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(576);
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.flags);
        for len in [
            self.questions.len(),
            self.answers.len(),
            self.authority.len(),
            self.additional.len(),
        ] {
            buf.put_u16(u16::try_from(len).map_err(|_| WireError::TruncatedRecord)?);
        }

        for q in &self.questions {
            q.name.write_to(&mut buf)?;
            buf.put_u16(q.qtype);
            buf.put_u16(q.class);
        }
        for rr in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            let rdlength = u16::try_from(rr.rdata.len()).map_err(|_| WireError::TruncatedRecord)?;
            rr.name.write_to(&mut buf)?;
            buf.put_u16(rr.rtype);
            buf.put_u16(rr.class);
            buf.put_u32(rr.ttl);
            buf.put_u16(rdlength);
            buf.put_slice(&rr.rdata);
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader);
        }
        let field = |pos| read_u16(buf, pos).ok_or(WireError::TruncatedHeader);
        let transaction_id = field(0)?;
        let flags = field(2)?;
        let qdcount = field(4)?;
        let ancount = field(6)?;
        let nscount = field(8)?;
        let arcount = field(10)?;

        let mut pos = HEADER_SIZE;
        let mut questions = Vec::with_capacity(usize::from(qdcount).min(16));
        for _ in 0..qdcount {
            let (name, next) = NetBiosName::read_from(buf, pos)?;
            let qtype = read_u16(buf, next).ok_or(WireError::TruncatedQuestion)?;
            let class = read_u16(buf, next + 2).ok_or(WireError::TruncatedQuestion)?;
            questions.push(Question { name, qtype, class });
            pos = next + 4;
        }

        let answers = read_records(buf, &mut pos, ancount)?;
        let authority = read_records(buf, &mut pos, nscount)?;
        let additional = read_records(buf, &mut pos, arcount)?;

        Ok(Packet {
            transaction_id,
            flags,
            questions,
            answers,
            authority,
            additional,
        })
    }

    /// Human-readable dump for the logger sink
    pub fn describe(&self) -> Vec<String> {
        let mut lines = vec![
            format!("transaction id: 0x{:04x}", self.transaction_id),
            format!(
                "flags: 0x{:04x} ({} {}, rcode {}{}{})",
                self.flags,
                self.opcode(),
                if self.is_response() { "response" } else { "request" },
                self.rcode(),
                if self.is_broadcast() { ", broadcast" } else { "" },
                if self.flags & FLAG_TRUNCATED != 0 { ", truncated" } else { "" },
            ),
        ];
        for q in &self.questions {
            lines.push(format!("question: {} type=0x{:04x} class={}", q.name, q.qtype, q.class));
        }
        for (section, records) in [
            ("answer", &self.answers),
            ("authority", &self.authority),
            ("additional", &self.additional),
        ] {
            for rr in records {
                let rdata = match rr.address() {
                    Ok(addr) if rr.rtype == TYPE_NB => addr.to_string(),
                    _ => rr.rdata.iter().map(|b| format!("{:02x}", b)).collect(),
                };
                lines.push(format!(
                    "{}: {} type=0x{:04x} ttl={} rdata={}",
                    section, rr.name, rr.rtype, rr.ttl, rdata
                ));
            }
        }
        lines
    }
}

fn read_records(
    buf: &[u8],
    pos: &mut usize,
    count: u16,
) -> Result<Vec<ResourceRecord>, WireError> {
    let mut records = Vec::with_capacity(usize::from(count).min(16));
    for _ in 0..count {
        let (name, next) = NetBiosName::read_from(buf, *pos)?;
        let rtype = read_u16(buf, next).ok_or(WireError::TruncatedRecord)?;
        let class = read_u16(buf, next + 2).ok_or(WireError::TruncatedRecord)?;
        let ttl = read_u32(buf, next + 4).ok_or(WireError::TruncatedRecord)?;
        let rdlength = usize::from(read_u16(buf, next + 8).ok_or(WireError::TruncatedRecord)?);
        let start = next + 10;
        let rdata = buf
            .get(start..start + rdlength)
            .ok_or(WireError::TruncatedRecord)?;
        records.push(ResourceRecord {
            name,
            rtype,
            class,
            ttl,
            rdata: rdata.to_vec(),
        });
        *pos = start + rdlength;
    }
    Ok(records)
}
