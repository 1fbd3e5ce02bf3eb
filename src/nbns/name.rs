//! NetBIOS names and their first-level encoding (RFC 1001 §14.1).
//!
//! Names are byte strings; they are held as Latin-1 text so every byte maps
//! to exactly one `char`.

use crate::error::WireError;
use crate::wire::{self, MAX_LABEL_LEN, MAX_NAME_LEN};
use std::fmt;

/// Raw NetBIOS name length, including the suffix byte
pub const NETBIOS_NAME_LEN: usize = 16;
/// Length of the first-level encoded name
pub const ENCODED_NAME_LEN: usize = 32;

const PAD: u8 = b' ';

/// A NetBIOS name with an optional scope ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetBiosName {
    name: String,
    scope: Option<String>,
}

impl NetBiosName {
    /// Validate and build a name. An empty scope is the same as no scope.
    pub fn new(name: &str, scope: Option<&str>) -> Result<Self, WireError> {
        validate_name(name)?;
        let scope = scope.filter(|s| !s.is_empty());
        if let Some(scope) = scope {
            validate_scope(scope)?;
        }
        Ok(NetBiosName {
            name: name.to_string(),
            scope: scope.map(str::to_string),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// First-level encoding: 32 characters in 'A'..='P', then ".scope"
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            ENCODED_NAME_LEN + self.scope.as_ref().map_or(0, |s| s.len() + 1),
        );
        for byte in self.padded() {
            out.push(char::from(b'A' + (byte >> 4)));
            out.push(char::from(b'A' + (byte & 0x0F)));
        }
        if let Some(scope) = &self.scope {
            out.push('.');
            out.push_str(scope);
        }
        out
    }

    /// Invert `encode`. Trailing pad spaces are stripped from the name.
    pub fn decode(encoded: &str) -> Result<Self, WireError> {
        let (label, scope) = match encoded.split_once('.') {
            Some((label, scope)) => (label, Some(scope)),
            None => (encoded, None),
        };
        if label.len() != ENCODED_NAME_LEN {
            return Err(WireError::InvalidEncoding(format!(
                "expected {} characters, got {}",
                ENCODED_NAME_LEN,
                label.len()
            )));
        }

        let mut raw = [0u8; NETBIOS_NAME_LEN];
        for (i, pair) in label.as_bytes().chunks(2).enumerate() {
            let high = nibble(pair[0])?;
            let low = nibble(pair[1])?;
            raw[i] = (high << 4) | low;
        }

        let trimmed = raw
            .iter()
            .rposition(|&b| b != PAD)
            .map_or(&raw[..0], |last| &raw[..=last]);
        let name: String = trimmed.iter().map(|&b| char::from(b)).collect();

        Ok(NetBiosName {
            name,
            scope: scope.filter(|s| !s.is_empty()).map(str::to_string),
        })
    }

    /// Append the wire form: encoded label, scope labels, zero terminator.
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        wire::write_name(buf, &self.encode())
    }

    /// Read a name at `offset`, returning it and the offset after it.
    pub fn read_from(msg: &[u8], offset: usize) -> Result<(Self, usize), WireError> {
        let (dotted, next) = wire::decode_name(msg, offset)?;
        Ok((Self::decode(&dotted)?, next))
    }

    /// Name padded to 16 bytes with spaces
    fn padded(&self) -> [u8; NETBIOS_NAME_LEN] {
        let mut raw = [PAD; NETBIOS_NAME_LEN];
        for (slot, c) in raw.iter_mut().zip(self.name.chars()) {
            // validate_name guarantees Latin-1
            *slot = u32::from(c) as u8;
        }
        raw
    }
}

impl fmt::Display for NetBiosName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.name.chars() {
            if c.is_ascii_graphic() || c == ' ' {
                write!(f, "{}", c)?;
            } else {
                write!(f, "<{:02x}>", u32::from(c))?;
            }
        }
        if let Some(scope) = &self.scope {
            write!(f, ".{}", scope)?;
        }
        Ok(())
    }
}

fn nibble(c: u8) -> Result<u8, WireError> {
    match c {
        b'A'..=b'P' => Ok(c - b'A'),
        _ => Err(WireError::InvalidEncoding(format!(
            "character {:?} outside A..P",
            char::from(c)
        ))),
    }
}

fn validate_name(name: &str) -> Result<(), WireError> {
    if name.is_empty() {
        return Err(WireError::InvalidNetBiosName("empty name".into()));
    }
    if name.starts_with('*') {
        return Err(WireError::InvalidNetBiosName(
            "name must not start with '*'".into(),
        ));
    }
    if name.chars().any(|c| u32::from(c) > 0xFF) {
        return Err(WireError::InvalidNetBiosName(
            "name must be single-byte characters".into(),
        ));
    }
    if name.chars().count() > NETBIOS_NAME_LEN {
        return Err(WireError::InvalidNetBiosName(format!(
            "name longer than {} bytes",
            NETBIOS_NAME_LEN
        )));
    }
    Ok(())
}

/// Scope IDs are domain names: labels of 1..63 characters from
/// `[A-Za-z0-9-]`, not starting or ending with '-'.
fn validate_scope(scope: &str) -> Result<(), WireError> {
    // encoded label + dot + scope must fit in a domain name
    if ENCODED_NAME_LEN + 1 + scope.len() > MAX_NAME_LEN {
        return Err(WireError::InvalidScope(scope.to_string()));
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    };
    if scope.split('.').all(valid_label) {
        Ok(())
    } else {
        Err(WireError::InvalidScope(scope.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_encode_fred() {
        let name = NetBiosName::new("FRED", Some("")).unwrap();
        assert_eq!(name.encode(), "EGFCEFEECACACACACACACACACACACACA");
        assert_eq!(name.scope(), None);
    }

    #[test]
    fn test_decode_fred() {
        let name = NetBiosName::decode("EGFCEFEECACACACACACACACACACACACA").unwrap();
        assert_eq!(name.name(), "FRED");
        assert_eq!(name.scope(), None);
    }

    #[test]
    fn test_roundtrip_with_scope() {
        let name = NetBiosName::new("WORKSTATION", Some("corp.example")).unwrap();
        let encoded = name.encode();
        let (label, scope) = encoded.split_once('.').unwrap();
        assert_eq!(label.len(), 32);
        assert!(label.bytes().all(|b| (b'A'..=b'P').contains(&b)));
        assert_eq!(scope, "corp.example");
        assert_eq!(NetBiosName::decode(&encoded).unwrap(), name);
    }

    #[test]
    fn test_roundtrip_suffix_byte() {
        // Workgroup master browser name: 15 padded chars then suffix 0x1D
        let raw = "WORKGROUP      \u{1d}";
        let name = NetBiosName::new(raw, None).unwrap();
        let decoded = NetBiosName::decode(&name.encode()).unwrap();
        assert_eq!(decoded.name(), raw);
        assert_eq!(format!("{}", decoded), "WORKGROUP      <1d>");
    }

    #[test]
    fn test_roundtrip_high_bytes() {
        let raw = "CAF\u{e9}";
        let name = NetBiosName::new(raw, None).unwrap();
        assert_eq!(NetBiosName::decode(&name.encode()).unwrap(), name);
    }

    #[test]
    fn test_rejects_invalid_names() {
        let too_long = NetBiosName::new("ABCDEFGHIJKLMNOPQ", None).unwrap_err();
        assert_eq!(too_long.kind(), ErrorKind::Validation);
        assert!(NetBiosName::new("*SMBSERVER", None).is_err());
        assert!(NetBiosName::new("", None).is_err());
        assert!(NetBiosName::new("\u{263a}", None).is_err());
        assert!(NetBiosName::new("ABCDEFGHIJKLMNOP", None).is_ok());
    }

    #[test]
    fn test_rejects_invalid_scopes() {
        for scope in ["-corp", "corp-", "a..b", "under_score", "sp ace"] {
            let err = NetBiosName::new("HOST", Some(scope)).unwrap_err();
            assert_eq!(err, WireError::InvalidScope(scope.to_string()));
        }
        let long_label = "a".repeat(64);
        assert!(NetBiosName::new("HOST", Some(&long_label)).is_err());
        assert!(NetBiosName::new("HOST", Some("a-1.b2.C3")).is_ok());
    }

    #[test]
    fn test_decode_rejects_bad_encoding() {
        assert!(matches!(
            NetBiosName::decode("EGFC"),
            Err(WireError::InvalidEncoding(_))
        ));
        assert!(matches!(
            NetBiosName::decode("ZGFCEFEECACACACACACACACACACACACA"),
            Err(WireError::InvalidEncoding(_))
        ));
        assert!(matches!(
            NetBiosName::decode("egfcefeecacacacacacacacacacacaca"),
            Err(WireError::InvalidEncoding(_))
        ));
    }

    #[test]
    fn test_wire_form() {
        let name = NetBiosName::new("FRED", Some("net")).unwrap();
        let mut buf = Vec::new();
        name.write_to(&mut buf).unwrap();
        assert_eq!(buf[0], 32);
        assert_eq!(&buf[1..33], b"EGFCEFEECACACACACACACACACACACACA");
        assert_eq!(&buf[33..], &[3, b'n', b'e', b't', 0]);

        let (decoded, next) = NetBiosName::read_from(&buf, 0).unwrap();
        assert_eq!(decoded, name);
        assert_eq!(next, buf.len());
    }
}
