//! Structured error types for the name services.

use std::fmt;
use std::io;

/// Main error type for name service operations
#[derive(Debug)]
pub enum Error {
    /// IO error (socket bind, send, receive)
    Io(io::Error),
    /// Configuration error
    Config(String),
    /// Wire format error (encoding, decoding, validation)
    Wire(WireError),
    /// NetBIOS name registry error
    Registry(RegistryError),
    /// Deadline exceeded awaiting a response
    Timeout,
    /// The server or client has been closed
    Closed,
    /// `listen_and_serve` called without any registered handler
    NoHandlers,
    /// Network string is not one of the supported families
    UnknownNetwork(String),
    /// Address string could not be parsed
    InvalidAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Wire(e) => write!(f, "Wire format error: {}", e),
            Error::Registry(e) => write!(f, "Registry error: {}", e),
            Error::Timeout => write!(f, "Timed out waiting for response"),
            Error::Closed => write!(f, "Use of closed socket"),
            Error::NoHandlers => write!(f, "No handlers registered"),
            Error::UnknownNetwork(net) => write!(f, "Unknown network: {}", net),
            Error::InvalidAddress(addr) => write!(f, "Invalid address: {}", addr),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Wire(e) => Some(e),
            Error::Registry(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        Error::Wire(err)
    }
}

impl From<RegistryError> for Error {
    fn from(err: RegistryError) -> Self {
        Error::Registry(err)
    }
}

/// Broad classification of wire errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller supplied a value that cannot be encoded
    Validation,
    /// Received bytes do not form a valid message
    Framing,
}

/// Errors raised by the LLMNR and NBNS codecs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Domain name longer than 255 characters
    NameTooLong,
    /// Label longer than 63 bytes
    LabelTooLong,
    /// Empty label inside a dotted name ("a..b")
    EmptyLabel,
    /// Label bytes are not valid UTF-8
    InvalidLabel,
    /// Name runs past the end of the message
    TruncatedName,
    /// Compression pointer runs past the end of the message
    TruncatedPointer,
    /// Compression pointer targets itself or a later offset
    InvalidPointer,
    /// Fewer than 12 bytes available for the header
    TruncatedHeader,
    /// Question type/class runs past the end of the message
    TruncatedQuestion,
    /// Resource record fixed fields or RDATA run past the end of the message
    TruncatedRecord,
    /// NetBIOS name fails validation (length, leading '*', charset)
    InvalidNetBiosName(String),
    /// First-level encoded name is malformed
    InvalidEncoding(String),
    /// Scope ID is not a valid domain name
    InvalidScope(String),
    /// RDATA does not hold an address
    InvalidRdata,
}

impl WireError {
    /// Validation errors come from caller input; framing errors from received bytes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::NameTooLong
            | WireError::LabelTooLong
            | WireError::EmptyLabel
            | WireError::InvalidNetBiosName(_)
            | WireError::InvalidScope(_) => ErrorKind::Validation,
            _ => ErrorKind::Framing,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::NameTooLong => write!(f, "name exceeds maximum length (255)"),
            WireError::LabelTooLong => write!(f, "label exceeds maximum length (63)"),
            WireError::EmptyLabel => write!(f, "empty label in name"),
            WireError::InvalidLabel => write!(f, "label is not valid UTF-8"),
            WireError::TruncatedName => write!(f, "name extends beyond packet"),
            WireError::TruncatedPointer => {
                write!(f, "compression pointer extends beyond packet")
            }
            WireError::InvalidPointer => {
                write!(f, "compression pointer does not point backwards")
            }
            WireError::TruncatedHeader => write!(f, "packet too short for header"),
            WireError::TruncatedQuestion => write!(f, "packet too short for question"),
            WireError::TruncatedRecord => write!(f, "packet too short for resource record"),
            WireError::InvalidNetBiosName(msg) => write!(f, "invalid NetBIOS name: {}", msg),
            WireError::InvalidEncoding(msg) => write!(f, "invalid first-level encoding: {}", msg),
            WireError::InvalidScope(scope) => write!(f, "invalid scope ID: {}", scope),
            WireError::InvalidRdata => write!(f, "RDATA does not contain an address"),
        }
    }
}

impl std::error::Error for WireError {}

/// NetBIOS name registry errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registration denied: name held with incompatible semantics
    Conflict(String),
    /// No active record for the name
    NotFound(String),
    /// Release of a unique name by an address that does not own it
    OwnerMismatch(String),
    /// Refresh or release from an address missing from the owner list
    NotOwner(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Conflict(name) => write!(f, "name conflict: {}", name),
            RegistryError::NotFound(name) => write!(f, "name not found: {}", name),
            RegistryError::OwnerMismatch(name) => {
                write!(f, "owner does not match unique name: {}", name)
            }
            RegistryError::NotOwner(name) => write!(f, "address is not an owner of: {}", name),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Convenience type alias for Results using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_io_display() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_config_display() {
        let err = Error::Config("bad port".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad port");
    }

    #[test]
    fn test_error_unknown_network_display() {
        let err = Error::UnknownNetwork("tcp7".to_string());
        assert!(err.to_string().contains("tcp7"));
    }

    #[test]
    fn test_error_from_conversions() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "x").into();
        assert!(matches!(err, Error::Io(_)));

        let err: Error = WireError::LabelTooLong.into();
        assert!(matches!(err, Error::Wire(WireError::LabelTooLong)));

        let err: Error = RegistryError::Conflict("HOST".to_string()).into();
        assert!(matches!(err, Error::Registry(RegistryError::Conflict(_))));
    }

    #[test]
    fn test_error_source() {
        assert!(Error::Wire(WireError::NameTooLong).source().is_some());
        assert!(Error::Registry(RegistryError::NotFound("A".into()))
            .source()
            .is_some());
        assert!(Error::Timeout.source().is_none());
        assert!(Error::Closed.source().is_none());
    }

    #[test]
    fn test_wire_error_kind() {
        assert_eq!(WireError::LabelTooLong.kind(), ErrorKind::Validation);
        assert_eq!(
            WireError::InvalidScope("-bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(WireError::TruncatedName.kind(), ErrorKind::Framing);
        assert_eq!(WireError::InvalidPointer.kind(), ErrorKind::Framing);
    }

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::OwnerMismatch("HOST".to_string());
        assert!(err.to_string().contains("HOST"));
        assert!(err.to_string().contains("owner"));
    }
}
