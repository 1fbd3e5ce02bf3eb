//! NetBIOS Name Service (RFC 1001/1002), IPv4 only.

pub mod challenger;
pub mod handler;
pub mod name;
pub mod packet;
pub mod redirect;
pub mod registry;
pub mod tcp;
pub mod udp;

/// UDP and TCP port of the name service
pub const NBNS_PORT: u16 = 137;
/// TTL of answers to name queries, in seconds
pub const NAME_QUERY_TTL: u32 = 86400;

pub use challenger::{defend_name, Challenger};
pub use handler::PacketHandler;
pub use name::NetBiosName;
pub use packet::{Opcode, Packet, Question, Rcode, ResourceRecord};
pub use redirect::RedirectManager;
pub use registry::{NameRecord, NameStatus, NameType, Registry};
pub use tcp::TcpServer;
pub use udp::UdpServer;
