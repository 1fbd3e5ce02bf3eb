//! Shared wire-format toolkit (RFC 1035 names, big-endian field access).
//!
//! LLMNR messages use DNS wire format directly. NBNS carries its
//! first-level encoded names as DNS label sequences too, so both codecs
//! share the name encoder and the compression-aware decoder below.

use crate::error::WireError;
use bytes::BufMut;

/// Maximum textual length of a domain name
pub const MAX_NAME_LEN: usize = 255;
/// Maximum length of a single label
pub const MAX_LABEL_LEN: usize = 63;
/// Size of the fixed DNS/LLMNR/NBNS header
pub const HEADER_SIZE: usize = 12;

const POINTER_BITS: u8 = 0xC0;
const POINTER_OFFSET_MASK: u8 = 0x3F;

/// Check that `name` can be encoded, without producing any bytes.
///
/// A single trailing dot is accepted and ignored; the empty name and "."
/// both denote the root.
pub fn validate_name(name: &str) -> Result<(), WireError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.len() > MAX_NAME_LEN {
        return Err(WireError::NameTooLong);
    }
    if trimmed.is_empty() {
        return Ok(());
    }
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(WireError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }
    }
    Ok(())
}

/// Encode a dotted name as length-prefixed labels terminated by a zero byte.
pub fn encode_name(name: &str) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(name.len() + 2);
    write_name(&mut buf, name)?;
    Ok(buf)
}

/// Append the wire form of `name` to `buf`. Nothing is written on error.
pub fn write_name(buf: &mut Vec<u8>, name: &str) -> Result<(), WireError> {
    validate_name(name)?;
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if !trimmed.is_empty() {
        for label in trimmed.split('.') {
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
    }
    buf.put_u8(0);
    Ok(())
}

/// Decode a possibly compressed name starting at `offset` within `msg`.
///
/// Returns the dotted name (no trailing dot, "." for the root) and the
/// offset of the first byte after the name as it appears at `offset`.
/// Compression pointers must target an offset strictly before the start of
/// the walk that contains them, which rules out loops.
pub fn decode_name(msg: &[u8], offset: usize) -> Result<(String, usize), WireError> {
    let mut labels = Vec::new();
    let mut total_len = 0usize;
    let end = walk_labels(msg, offset, &mut labels, &mut total_len)?;

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        labels.join(".")
    };
    Ok((name, end))
}

fn walk_labels(
    msg: &[u8],
    start: usize,
    labels: &mut Vec<String>,
    total_len: &mut usize,
) -> Result<usize, WireError> {
    let mut pos = start;

    loop {
        let len = *msg.get(pos).ok_or(WireError::TruncatedName)?;

        if len == 0 {
            return Ok(pos + 1);
        }

        if len & POINTER_BITS == POINTER_BITS {
            let low = *msg.get(pos + 1).ok_or(WireError::TruncatedPointer)?;
            let target = (usize::from(len & POINTER_OFFSET_MASK) << 8) | usize::from(low);
            if target >= start {
                return Err(WireError::InvalidPointer);
            }
            walk_labels(msg, target, labels, total_len)?;
            return Ok(pos + 2);
        }

        // 0x40 and 0x80 label types are reserved
        if usize::from(len) > MAX_LABEL_LEN {
            return Err(WireError::LabelTooLong);
        }

        let label_start = pos + 1;
        let label_end = label_start + usize::from(len);
        if label_end > msg.len() {
            return Err(WireError::TruncatedName);
        }

        *total_len += usize::from(len) + usize::from(!labels.is_empty());
        if *total_len > MAX_NAME_LEN {
            return Err(WireError::NameTooLong);
        }

        let label = std::str::from_utf8(&msg[label_start..label_end])
            .map_err(|_| WireError::InvalidLabel)?;
        labels.push(label.to_string());
        pos = label_end;
    }
}

/// Read a big-endian u16 at `pos`
pub fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let bytes = buf.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian u32 at `pos`
pub fn read_u32(buf: &[u8], pos: usize) -> Option<u32> {
    let bytes = buf.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
